// demos/live_conversation.rs
//
// Talk to the model through the default microphone and speaker. Completed
// turns are printed as they are folded into history. Ctrl-C ends the session.
use gemini_live_conversation::{
    EnvCredentials, LiveConversation, LiveSessionSettings, SystemAudio, default_registry,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    dotenv::dotenv().ok();

    let settings = LiveSessionSettings::from_env();
    info!("[Main] Starting live session with {}.", settings.model);

    let mut conversation = LiveConversation::new(
        settings,
        Arc::new(SystemAudio::new()),
        Arc::new(EnvCredentials::new()),
        default_registry(),
    );
    conversation.start()?;

    let mut printed = 0;
    let mut last_tool_status: Option<String> = None;
    loop {
        tokio::select! {
            running = conversation.poll_once() => {
                for message in &conversation.history()[printed..] {
                    println!("{:>5}: {}", message.role.to_string(), message.content);
                }
                printed = conversation.history().len();

                let tool_status = conversation.tool_status().map(str::to_owned);
                if tool_status != last_tool_status {
                    if let Some(status) = &tool_status {
                        println!("[tool] {}", status);
                    }
                    last_tool_status = tool_status;
                }

                if !running {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("[Main] Ctrl-C received, stopping.");
                conversation.stop();
                break;
            }
        }
    }

    if let Some(error) = conversation.error() {
        warn!("[Main] Session ended with error: {}", error);
        eprintln!("{}", error);
    }
    Ok(())
}
