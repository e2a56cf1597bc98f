mod cli;
mod event_display;
mod shell;

pub use cli::Cli;

use std::fs::OpenOptions;
use std::sync::Arc;

use magus_core::Config;
use magus_core::Magus;
use magus_core::MagusErr;
use magus_core::config::color_enabled;
use magus_core::config::ensure_state_dir;
use magus_core::internal_name;
use magus_core::protocol::EventMsg;
use magus_core::protocol::Op;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;

use crate::event_display::EventRenderer;
use crate::shell::Shell;
use crate::shell::parse_approval;

/// Exit status for recoverable errors surfaced to stderr.
const EXIT_FAILURE: i32 = 1;
/// Exit status for configuration failures (invalid policy, unknown
/// provider, missing API key).
const EXIT_CONFIG: i32 = 2;

/// Run the CLI to completion and return the process exit code.
pub async fn run_main(cli: Cli) -> i32 {
    if let Some(provider) = &cli.provider
        && internal_name(provider).is_none()
    {
        eprintln!(
            "Error: unknown provider '{provider}' (expected gemini, chatgpt, claude or mistral)"
        );
        return EXIT_FAILURE;
    }

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            eprintln!("Error: cannot determine working directory: {e}");
            return EXIT_FAILURE;
        }
    };

    let mut config = Config::new(cwd);
    config.provider = cli.provider.clone();
    config.model = cli.model.clone();

    if let Err(e) = ensure_state_dir(&config) {
        eprintln!("Error: cannot create {}: {e}", config.state_dir().display());
        return EXIT_CONFIG;
    }

    let history_path = config.history_path();
    let debug_log_path = config.debug_log_path();
    let toggle_debug = init_logging(&config);

    let magus = match Magus::spawn(config).await {
        Ok(magus) => Arc::new(magus),
        Err(e) => {
            eprintln!("Error: {e}");
            return match e {
                MagusErr::Configuration(_) | MagusErr::EnvVar(_) => EXIT_CONFIG,
                _ => EXIT_FAILURE,
            };
        }
    };

    let renderer = EventRenderer::create_with_ansi(color_enabled());

    // The first event announces the configured session.
    match magus.next_event().await {
        Ok(event) => renderer.render(&event.msg),
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_FAILURE;
        }
    }

    if cli.request.is_empty() {
        let shell = Shell::new(
            magus,
            renderer,
            history_path,
            debug_log_path,
            toggle_debug,
        );
        match shell.run().await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("Error: {e}");
                EXIT_FAILURE
            }
        }
    } else {
        run_one_shot(&magus, &renderer, cli.request.join(" ")).await
    }
}

/// Initialise tracing with an append-only operator trace at
/// `.magus/debug.log` and return the `/debug` toggle.
fn init_logging(config: &Config) -> Box<dyn Fn(bool) + Send> {
    let base_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::<EnvFilter, Registry>::new(base_filter);

    match OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.debug_log_path())
    {
        Ok(file) => {
            tracing_subscriber::registry()
                .with(filter_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file)),
                )
                .init();
        }
        Err(e) => {
            eprintln!("warning: cannot open debug log: {e}");
            tracing_subscriber::registry()
                .with(filter_layer)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Box::new(move |verbose| {
        let directive = if verbose { "debug" } else { "info" };
        if let Err(e) = handle.reload(EnvFilter::new(directive)) {
            eprintln!("warning: cannot adjust log filter: {e}");
        }
    })
}

/// One turn, rendered to completion, then a clean shutdown.
async fn run_one_shot(magus: &Magus, renderer: &EventRenderer, text: String) -> i32 {
    let turn_id = match magus.submit(Op::UserInput { text }).await {
        Ok(id) => id,
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_FAILURE;
        }
    };

    let mut saw_error = false;
    loop {
        let event = match magus.next_event().await {
            Ok(event) => event,
            Err(e) => {
                eprintln!("Error: {e}");
                return EXIT_FAILURE;
            }
        };
        match &event.msg {
            EventMsg::ApprovalRequest { .. } => {
                renderer.render(&event.msg);
                let answer = read_stdin_line().await;
                let decision = parse_approval(&answer);
                if magus
                    .submit(Op::Approval {
                        id: event.id.clone(),
                        decision,
                    })
                    .await
                    .is_err()
                {
                    return EXIT_FAILURE;
                }
                continue;
            }
            EventMsg::Error { .. } => saw_error = true,
            _ => {}
        }
        let done = matches!(event.msg, EventMsg::TaskComplete) && event.id == turn_id;
        renderer.render(&event.msg);
        if done {
            break;
        }
    }

    if let Ok(id) = magus.submit(Op::Shutdown).await {
        while let Ok(event) = magus.next_event().await {
            if matches!(event.msg, EventMsg::ShutdownComplete) && event.id == id {
                break;
            }
        }
    }

    if saw_error { EXIT_FAILURE } else { 0 }
}

async fn read_stdin_line() -> String {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        line
    })
    .await
    .unwrap_or_default()
}
