use std::io::Write as _;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use tidechat::{
    ChatClient, ChatObserver, Message, MessageStatus, Role, SendOutcome, SendRejection,
    SettingsStore,
};
use tidechat::settings::SETTABLE_KEYS;
use tidechat_storage::{MessageId, SessionId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
commands:
  /new [name]      start a session
  /sessions        list sessions
  /switch <n>      switch to session n
  /rename <name>   rename the current session
  /delete [n]      delete session n (default: current)
  /clear           clear the current session
  /retry           regenerate the last reply
  /set [key value] show settings, or change one (applies on next start)
  /quit            exit
Ctrl-C stops a reply while it streams.";

/// Prints the streamed reply incrementally.
#[derive(Default)]
struct TerminalObserver {
    streaming: Mutex<Option<(MessageId, String)>>,
}

impl ChatObserver for TerminalObserver {
    fn messages_changed(&self, _session_id: &SessionId, messages: &[Message]) {
        let Some(reply) = messages.last().filter(|message| message.role == Role::Assistant)
        else {
            return;
        };
        let Ok(mut streaming) = self.streaming.lock() else {
            return;
        };

        if reply.status == MessageStatus::Loading {
            *streaming = Some((reply.id.clone(), String::new()));
            return;
        }

        let Some((message_id, shown)) = streaming.as_mut() else {
            return;
        };
        if message_id != &reply.id {
            return;
        }

        let mut stdout = std::io::stdout();
        match reply.content.strip_prefix(shown.as_str()) {
            Some(suffix) if reply.status != MessageStatus::Error => {
                let _ = write!(stdout, "{suffix}");
            }
            _ => {
                let _ = write!(stdout, "\n[{:?}] {}", reply.status, reply.content);
            }
        }
        let _ = stdout.flush();
        shown.clone_from(&reply.content);

        if reply.status.is_terminal() {
            if reply.status == MessageStatus::Cancelled {
                let _ = write!(stdout, " [cancelled]");
            }
            let _ = writeln!(stdout);
            *streaming = None;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();
    init_tracing(&settings.log_level);
    tracing::debug!(path = %settings_store.config_path().display(), "settings loaded");

    let mut client = match ChatClient::from_settings(&settings).await {
        Ok(client) => client.with_observer(Arc::new(TerminalObserver::default())),
        Err(error) => {
            tracing::error!(error = %error, "failed to start chat client");
            return ExitCode::FAILURE;
        }
    };

    if let Err(error) = client.load_sessions().await {
        tracing::warn!(error = %error, "starting without stored sessions");
    }

    println!("{HELP}");
    print_current(&client);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                tracing::error!(error = %error, "failed to read stdin");
                return ExitCode::FAILURE;
            }
        };

        if !run_line(&mut client, &settings_store, line.trim()).await {
            break;
        }
    }

    client.stop_generation().await;
    ExitCode::SUCCESS
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Returns `false` on `/quit`.
async fn run_line(client: &mut ChatClient, settings_store: &SettingsStore, line: &str) -> bool {
    let Some(command) = line.strip_prefix('/') else {
        let outcome = client.send(line).await;
        report_send(client, outcome).await;
        return true;
    };

    let (name, argument) = command
        .split_once(char::is_whitespace)
        .map(|(name, argument)| (name, argument.trim()))
        .unwrap_or((command, ""));

    let result = match name {
        "quit" | "exit" => return false,
        "help" => {
            println!("{HELP}");
            Ok(())
        }
        "new" => {
            let name = (!argument.is_empty()).then_some(argument);
            client.create_session(name).await;
            print_current(client);
            Ok(())
        }
        "sessions" => {
            print_sessions(client);
            Ok(())
        }
        "set" => {
            change_setting(settings_store, argument);
            Ok(())
        }
        "switch" => match session_at(client, argument) {
            Some(session_id) => client.switch_session(&session_id).await.map(|()| {
                print_current(client);
                print_history(client);
            }),
            None => {
                println!("no session {argument:?}, see /sessions");
                Ok(())
            }
        },
        "rename" => {
            let session_id = client.store().current_session_id().clone();
            client.rename_session(&session_id, argument).await
        }
        "delete" => {
            let target = if argument.is_empty() {
                Some(client.store().current_session_id().clone())
            } else {
                session_at(client, argument)
            };
            match target {
                Some(session_id) => client
                    .delete_session(&session_id)
                    .await
                    .map(|()| print_current(client)),
                None => {
                    println!("no session {argument:?}, see /sessions");
                    Ok(())
                }
            }
        }
        "clear" => {
            let session_id = client.store().current_session_id().clone();
            client.clear_history(&session_id).await
        }
        "retry" => {
            let last_reply = client
                .store()
                .current_messages()
                .iter()
                .rev()
                .find(|message| message.role == Role::Assistant)
                .map(|message| message.id.clone());
            match last_reply {
                Some(message_id) => match client.regenerate(&message_id).await {
                    Ok(outcome) => {
                        report_send(client, outcome).await;
                        Ok(())
                    }
                    Err(error) => Err(error),
                },
                None => {
                    println!("nothing to retry");
                    Ok(())
                }
            }
        }
        other => {
            println!("unknown command /{other}, try /help");
            Ok(())
        }
    };

    if let Err(error) = result {
        println!("error: {error}");
    }
    true
}

fn change_setting(settings_store: &SettingsStore, argument: &str) {
    let current = settings_store.settings();
    let Some((key, value)) = argument.split_once(char::is_whitespace) else {
        match serde_json::to_string_pretty(&*current) {
            Ok(json) => println!("{json}"),
            Err(error) => println!("error: {error}"),
        }
        println!("settable: {}", SETTABLE_KEYS.join(", "));
        return;
    };

    let updated = match (*current).clone().with_value(key, value) {
        Ok(updated) => updated,
        Err(error) => {
            println!("error: {error}");
            return;
        }
    };
    match settings_store.update(updated) {
        Ok(()) => println!(
            "saved {key} to {}, restart to apply",
            settings_store.config_path().display()
        ),
        Err(error) => {
            tracing::error!(error = %error, "failed to save settings");
            println!("error: {error}");
        }
    }
}

async fn report_send(client: &mut ChatClient, outcome: SendOutcome) {
    match outcome {
        SendOutcome::Started(_) => drive_until_settled(client).await,
        SendOutcome::Failed(_) => {}
        SendOutcome::Rejected(SendRejection::EmptyPrompt) => {}
        SendOutcome::Rejected(SendRejection::StreamActive { .. }) => {
            println!("a reply is still streaming");
        }
    }
}

async fn drive_until_settled(client: &mut ChatClient) {
    let Some(cancel) = client.cancel_handle() else {
        return;
    };

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    client.drive().await;
    interrupt.abort();
}

fn session_at(client: &ChatClient, argument: &str) -> Option<SessionId> {
    let index = argument.parse::<usize>().ok()?.checked_sub(1)?;
    client
        .store()
        .sessions()
        .get(index)
        .map(|session| session.id.clone())
}

fn print_sessions(client: &ChatClient) {
    let current = client.store().current_session_id();
    for (index, session) in client.store().sessions().iter().enumerate() {
        let marker = if &session.id == current { '*' } else { ' ' };
        let count = if session.messages_loaded {
            session.messages.len().to_string()
        } else {
            "?".to_string()
        };
        println!("{marker} {:>2}. {} ({count} messages)", index + 1, session.name);
    }
}

fn print_current(client: &ChatClient) {
    if let Some(session) = client.store().current_session() {
        println!("session: {}", session.name);
    }
}

fn print_history(client: &ChatClient) {
    for message in client.store().current_messages() {
        let speaker = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        println!("{speaker}: {}", message.content);
    }
}
