//! Interactive smoke client for the chat runtime.
//!
//! Lines read from stdin are sent as messages. `/snapshot` prints the ordered
//! history and `/quit` ends the session.

mod config;
mod logging;

use std::{process, sync::Arc, time::Duration};

use chat_core::{ChatCommand, ChatEvent, ConnectionState};
use chat_directline::{
    ChatRuntimeConfig, DirectLineConfig, DirectLineTransport, LoopbackTransport, Transport,
    spawn_runtime,
};
use chat_platform::JsonFileSessionBridge;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    time::timeout,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{SmokeConfig, TransportChoice};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            process::exit(2);
        }
    };

    let transport: Arc<dyn Transport> = match &config.transport {
        TransportChoice::Loopback => Arc::new(LoopbackTransport::default()),
        TransportChoice::DirectLine { domain } => {
            let dl_config = domain
                .as_deref()
                .map(DirectLineConfig::new)
                .unwrap_or_default();
            match DirectLineTransport::new(dl_config) {
                Ok(transport) => Arc::new(transport),
                Err(err) => {
                    eprintln!("Failed to initialize DirectLine transport: {err}");
                    process::exit(1);
                }
            }
        }
    };
    info!(transport = ?config.transport, session_id = %config.session_id, "starting chat smoke");

    let bridge = Arc::new(JsonFileSessionBridge::new(config.session_dir.clone()));
    let handle = spawn_runtime(
        transport,
        bridge,
        ChatRuntimeConfig::new(config.user_id.clone(), config.session_id.clone())
            .with_init(config.init.clone()),
    );
    let mut events = handle.subscribe();

    if let Err(err) = handle
        .send(ChatCommand::Start {
            credential: config.secret.clone(),
        })
        .await
    {
        error!(error = %err, "runtime rejected start");
        process::exit(1);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let command = match line {
                    Ok(Some(line)) => match line.trim() {
                        "" => continue,
                        "/quit" => break,
                        "/snapshot" => ChatCommand::Snapshot,
                        text => ChatCommand::SendText {
                            client_activity_id: Uuid::new_v4().to_string(),
                            text: text.to_owned(),
                        },
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "failed reading stdin");
                        break;
                    }
                };
                if let Err(err) = handle.send(command).await {
                    error!(error = %err, "runtime stopped accepting commands");
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if print_event(&event) {
                        return;
                    }
                }
                Err(err) => warn!(error = %err, "event stream lagged"),
            },
        }
    }

    if handle.send(ChatCommand::Stop).await.is_ok() {
        while let Ok(Ok(event)) = timeout(SHUTDOWN_GRACE, events.recv()).await {
            if print_event(&event) {
                break;
            }
        }
    }
}

/// Print one event. Returns `true` once the session is over.
fn print_event(event: &ChatEvent) -> bool {
    match event {
        ChatEvent::StatusChanged { state } => {
            println!("[status] {state:?}");
            return *state == ConnectionState::Ended;
        }
        ChatEvent::ActivityOrdered { message, position } => {
            let who = message
                .activity
                .sender_id
                .as_deref()
                .unwrap_or("unknown");
            println!(
                "[#{position}] {who} ({:?}): {}",
                message.render_state, message.activity.text
            );
        }
        ChatEvent::Typing { activity } => {
            println!("[typing] {}", activity.sender_id.as_deref().unwrap_or("agent"));
        }
        ChatEvent::StreamingUpdate(update) if update.is_final => {
            println!("[final] {}: {}", update.message_id, update.prefix);
        }
        ChatEvent::StreamingUpdate(_) => {}
        ChatEvent::ConnectionError {
            kind,
            code,
            message,
        } => {
            println!("[error] {kind:?} {code}: {message}");
            return true;
        }
        ChatEvent::SendAck(ack) => match (&ack.activity_id, &ack.error_code) {
            (Some(activity_id), _) => {
                println!("[sent] {} -> {activity_id}", ack.client_activity_id);
            }
            (None, code) => println!(
                "[send failed] {}: {}",
                ack.client_activity_id,
                code.as_deref().unwrap_or("unknown")
            ),
        },
        ChatEvent::TimelineSnapshot { messages } => {
            println!("[snapshot] {} messages", messages.len());
            for message in messages {
                println!("  {} {}", message.resolved_timestamp, message.activity.text);
            }
        }
    }
    false
}
