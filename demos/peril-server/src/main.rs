use peril::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Pause,
    Resume,
    Help,
    Quit,
}

impl Command {
    /// First word of the line decides; the rest is ignored.
    fn parse(line: &str) -> Option<Result<Self, String>> {
        let word = line.split_whitespace().next()?;
        Some(match word {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "help" => Ok(Self::Help),
            "quit" => Ok(Self::Quit),
            other => Err(other.to_string()),
        })
    }

    fn playing_state(self) -> Option<PlayingState> {
        match self {
            Self::Pause => Some(PlayingState { is_paused: true }),
            Self::Resume => Some(PlayingState { is_paused: false }),
            Self::Help | Self::Quit => None,
        }
    }
}

fn print_help() {
    println!("commands:");
    println!("  pause   pause the game for every player");
    println!("  resume  resume the game");
    println!("  help    show this help");
    println!("  quit    shut the server down");
}

// ---------------------------------------------------------------------------
// Server bootstrap
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    peril::init_tracing("info");

    let config = ClientConfig::default();
    let client = PerilClient::connect(config.clone()).await?;
    tracing::info!(uri = %config.uri, "connected to broker");

    let logs = client
        .subscribe_bincode(
            EXCHANGE_PERIL_TOPIC,
            GAME_LOG_SLUG,
            &game_log_binding(),
            SimpleQueueType::Durable,
            |log: GameLog| async move {
                println!("[{}] {}", log.username, log.message);
                AckType::Ack
            },
        )
        .await?;
    tracing::info!(
        exchange = EXCHANGE_PERIL_TOPIC,
        binding = %game_log_binding(),
        queue = logs.queue(),
        "game log queue bound"
    );

    let publisher = client.publisher(JsonCodec).await?;
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let command = match Command::parse(&line) {
            None => continue,
            Some(Ok(command)) => command,
            Some(Err(word)) => {
                println!("unrecognized command: {word}");
                continue;
            }
        };

        match command {
            Command::Help => print_help(),
            Command::Quit => break,
            Command::Pause | Command::Resume => {
                if let Some(state) = command.playing_state() {
                    publisher
                        .publish(EXCHANGE_PERIL_DIRECT, PAUSE_KEY, &state)
                        .await?;
                    println!(
                        "published {command:?} to {EXCHANGE_PERIL_DIRECT}"
                    );
                }
            }
        }
    }

    let stats = logs.shutdown().await?;
    tracing::info!(received = stats.acked, "game log subscription stopped");
    publisher.close().await?;
    client.shutdown().await?;
    Ok(())
}
