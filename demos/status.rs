//! Minimal CLI driver over [`xi_core::Core`], exercising the status,
//! verify, and attack-sim paths documented in the core's exit-code
//! contract. Not a public interface of the crate — a thin demonstration
//! of wiring `Core` up end to end.

use std::process::ExitCode;

use xi_core::Core;

const EXIT_OK: u8 = 0;
const EXIT_ADMISSION_DENIED: u8 = 2;
const EXIT_KILL_SWITCH_TRIPPED: u8 = 3;
const EXIT_CHAIN_INTEGRITY_COMPROMISED: u8 = 4;
const EXIT_CONFIG_ERROR: u8 = 5;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "status".to_string());

    let core = match Core::from_env().await {
        Ok(core) => core,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match command.as_str() {
        "status" => cmd_status(&core).await,
        "verify" => cmd_verify(&core).await,
        "attack-sim" => cmd_attack_sim(&core).await,
        "logs" => cmd_logs(&core).await,
        other => {
            eprintln!("unknown command: {other}\nusage: xi-status [status|verify|attack-sim|logs]");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

async fn cmd_status(core: &Core) -> ExitCode {
    let snapshot = core.status().await;
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            eprintln!("failed to render status: {err}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    }

    if !snapshot.autoheal.active {
        return ExitCode::from(EXIT_KILL_SWITCH_TRIPPED);
    }
    if !snapshot.autoheal.chain_integrity {
        return ExitCode::from(EXIT_CHAIN_INTEGRITY_COMPROMISED);
    }
    ExitCode::from(EXIT_OK)
}

const DEFAULT_LOG_TAIL: usize = 20;

async fn cmd_logs(core: &Core) -> ExitCode {
    let entries = core.autoheal.chain.tail(DEFAULT_LOG_TAIL).await;
    if entries.is_empty() {
        println!("no log entries yet");
        return ExitCode::from(EXIT_OK);
    }
    for entry in entries {
        println!(
            "{} {} prev={} root={}",
            entry.timestamp.to_rfc3339(),
            entry.event,
            &entry.prev_root[..16],
            &entry.merkle_root[..16],
        );
    }
    ExitCode::from(EXIT_OK)
}

async fn cmd_verify(core: &Core) -> ExitCode {
    if core.autoheal.verify_integrity().await {
        println!("chain integrity: VALID");
        ExitCode::from(EXIT_OK)
    } else {
        println!("chain integrity: COMPROMISED");
        ExitCode::from(EXIT_CHAIN_INTEGRITY_COMPROMISED)
    }
}

/// Push a burst of low-confidence actions through the gate, matching
/// end-to-end scenario 2 in shape, and report whether admission still
/// passes afterward.
async fn cmd_attack_sim(core: &Core) -> ExitCode {
    for _ in 0..95 {
        core.record_action(1.0).await;
    }
    for _ in 0..5 {
        core.record_action(0.10).await;
    }

    let (pass, components) = core.check_admission().await;
    println!(
        "omega={:.4} cvar={:.4} beta={:.4} err_5m={:.4} idem={:.4} admitted={}",
        components.omega, components.cvar, components.beta, components.err_5m, components.idem, pass
    );

    let state = core.stabilizer_state().await;
    println!(
        "psi_target={:.4} price_multiplier={:.2} attack_mode={}",
        state.psi_target, state.price_multiplier, state.attack_mode
    );

    if pass {
        ExitCode::from(EXIT_OK)
    } else {
        ExitCode::from(EXIT_ADMISSION_DENIED)
    }
}
