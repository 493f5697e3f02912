use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use config::Config;
use logging::init_logging;
use model::PushPayload;
use reminder::{PassOptions, MAX_LOOKAHEAD_DAYS};
use server::serve;
use server_state::ServerState;

mod attach;
mod config;
mod dispatch;
mod logging;
mod model;
mod push;
mod rate_limiter;
mod reminder;
mod server;
mod server_state;
mod store;

#[derive(Parser)]
struct Opts {
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser)]
enum SubCommand {
    /// Run the HTTP API.
    Serve {
        #[clap(short, long)]
        port: Option<u16>,
    },
    /// Run a single reminder pass and print the report.
    Remind {
        #[clap(long)]
        force: bool,
        #[clap(long, value_parser = clap::value_parser!(u32).range(0..=i64::from(MAX_LOOKAHEAD_DAYS)))]
        lookahead: Option<u32>,
    },
    /// Send one notification to every active subscription.
    Broadcast {
        #[clap(long)]
        title: String,
        #[clap(long)]
        body: String,
        #[clap(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let opts = Opts::parse();
    let config = Config::from_env()?;
    let state = ServerState::init(config).await?;

    match opts.subcmd {
        SubCommand::Serve { port } => {
            serve(state, port).await?;
        }
        SubCommand::Remind { force, lookahead } => {
            let options = PassOptions {
                now: Utc::now(),
                lookahead_days: lookahead.unwrap_or(state.config.lookahead_days),
                throttle_interval: state.config.throttle_interval,
                force,
            };
            let report = state.scanner()?.run_due_reminder_pass(options).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            state.shutdown();
        }
        SubCommand::Broadcast { title, body, url } => {
            let payload = PushPayload::new(&title, &body, url.as_deref());
            let report = state.engine()?.send_to_all(&payload).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            state.shutdown();
        }
    }

    Ok(())
}
