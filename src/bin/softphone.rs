//! Example softphone driver.
//!
//! Registers with the SIP server from the environment, answers inbound
//! calls, and optionally places one outbound call:
//!
//!     softphone [--call NUMBER]

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use sipline::{CallState, Config, VoipPhone};

struct Args {
    call: Option<String>,
    help: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args {
        call: None,
        help: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--call" => {
                if i + 1 < args.len() {
                    i += 1;
                    result.call = Some(args[i].clone());
                }
            }
            "--help" | "-h" => result.help = true,
            _ => {}
        }
        i += 1;
    }

    result
}

fn print_help() {
    println!("softphone - sipline example driver\n");
    println!("USAGE:");
    println!("    softphone [OPTIONS]\n");
    println!("OPTIONS:");
    println!("    --call NUMBER    Place an outbound call after registering");
    println!("    --help, -h       Show this help message\n");
    println!("ENVIRONMENT:");
    println!("    SIP_SERVER, SIP_USERNAME, SIP_PASSWORD (required)");
    println!("    SIP_PORT, LOCAL_IP, LOCAL_PORT, OUTBOUND_PROXY,");
    println!("    RTP_PORT_LOW, RTP_PORT_HIGH, BEHIND_NAT, DEFAULT_EXPIRES_SECS");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    if args.help {
        print_help();
        return Ok(());
    }

    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sipline=info".parse().unwrap()),
        )
        .init();

    info!("sipline softphone v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;
    info!("  SIP server: {}:{}", config.server, config.port);
    info!("  Account: {}", config.username);
    let config = Arc::new(config);

    // Inbound calls: answer, echo DTMF digits, leave hangup to the peer
    let callback = Arc::new(|call: Arc<sipline::Call>| {
        tokio::spawn(async move {
            info!("Answering incoming call {}", call.call_id());
            if let Err(e) = call.answer().await {
                error!("Answer failed: {}", e);
                return;
            }
            while call.state() == CallState::Answered {
                while let Some(digit) = call.read_dtmf() {
                    info!("DTMF: {}", digit);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            info!("Call {} finished in state {}", call.call_id(), call.state().name());
        });
    }) as Arc<sipline::phone::IncomingCallCallback>;

    let phone = VoipPhone::new(config, Some(callback))
        .await
        .context("Failed to create phone")?;
    phone.start().await.context("Failed to start phone")?;
    info!("Phone registered and ready");

    if let Some(number) = args.call {
        match phone.call(&number).await {
            Ok(call) => {
                info!("Dialing {}...", number);
                match call.wait_answered(Duration::from_secs(30)).await {
                    Ok(()) => {
                        info!("Connected; holding the line for 10s");
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        if call.state() == CallState::Answered {
                            if let Err(e) = call.hangup().await {
                                warn!("Hangup failed: {}", e);
                            }
                        }
                    }
                    Err(e) => warn!("Call did not connect: {}", e),
                }
            }
            Err(e) => error!("Call failed: {}", e),
        }
    } else {
        info!("Waiting for calls; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await.ok();
    }

    phone.stop().await.ok();
    info!("Stopped");
    Ok(())
}
