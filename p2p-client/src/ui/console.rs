//! Line-oriented console front-end.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::common::{NetworkCommand, NetworkEvent};

use super::state::AppState;

pub const HELP: &str = "\
Commands:
  /connect <user>       ask <user> for a direct chat
  /msg <user> <text>    send <text> to <user> and make them the active chat
  <text>                send to the active chat
  /close <user>         close the direct channel to <user>
  /users                list and refresh online users
  /accept [user]        accept a pending request (oldest if no user given)
  /reject [user]        reject a pending request
  /quit                 log out and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(NetworkCommand),
    /// Plain text for whoever the active chat is.
    Chat(String),
    Accept(Option<String>),
    Reject(Option<String>),
    Help,
    Quit,
    Invalid(String),
}

pub fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Input::Chat(line.to_string()));
    };

    let (verb, args) = match rest.split_once(char::is_whitespace) {
        Some((verb, args)) => (verb, args.trim()),
        None => (rest, ""),
    };
    let user_arg = || args.split_whitespace().next().map(str::to_string);

    let input = match verb {
        "connect" => match user_arg() {
            Some(peer) => Input::Command(NetworkCommand::ConnectToPeer { peer }),
            None => Input::Invalid("usage: /connect <user>".into()),
        },
        "msg" => match args.split_once(char::is_whitespace) {
            Some((to, content)) if !content.trim().is_empty() => {
                Input::Command(NetworkCommand::SendMessage {
                    to: to.to_string(),
                    content: content.trim().to_string(),
                })
            }
            _ => Input::Invalid("usage: /msg <user> <text>".into()),
        },
        "close" => match user_arg() {
            Some(peer) => Input::Command(NetworkCommand::ClosePeer { peer }),
            None => Input::Invalid("usage: /close <user>".into()),
        },
        "users" => Input::Command(NetworkCommand::RefreshOnlineUsers),
        "accept" => Input::Accept(user_arg()),
        "reject" => Input::Reject(user_arg()),
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Invalid(format!("unknown command /{other}; try /help")),
    };
    Some(input)
}

/// Run the console until the user quits or the network side stops.
///
/// With `auto_accept`, every incoming request is accepted on arrival.
pub async fn run(
    command_sender: mpsc::Sender<NetworkCommand>,
    mut event_receiver: mpsc::Receiver<NetworkEvent>,
    auto_accept: bool,
) {
    let mut state = AppState::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    loop {
        tokio::select! {
            event = event_receiver.recv() => {
                let Some(event) = event else { break };
                let disconnected = matches!(event, NetworkEvent::ServerDisconnected);
                match event {
                    NetworkEvent::PeerRequest(request) if auto_accept => {
                        println!("Accepting chat request from {}", request.peer());
                        request.accept();
                    }
                    event => {
                        if let Some(line) = state.apply(event) {
                            println!("{line}");
                        }
                    }
                }
                if disconnected {
                    break;
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        send(&command_sender, NetworkCommand::Logout).await;
                        break;
                    }
                    Err(err) => {
                        log::warn!("Failed to read stdin: {err}");
                        continue;
                    }
                };
                let Some(input) = parse_input(&line) else { continue };
                if !handle_input(input, &mut state, &command_sender).await {
                    break;
                }
            }
        }
    }
}

/// Returns `false` once the user asked to quit.
async fn handle_input(
    input: Input,
    state: &mut AppState,
    command_sender: &mpsc::Sender<NetworkCommand>,
) -> bool {
    match input {
        Input::Command(command) => {
            if let NetworkCommand::SendMessage { to, .. } = &command {
                state.active_peer = Some(to.clone());
            }
            if matches!(command, NetworkCommand::RefreshOnlineUsers) {
                println!("{}", state.online_summary());
            }
            send(command_sender, command).await;
        }
        Input::Chat(content) => match state.active_peer.clone() {
            Some(to) => send(command_sender, NetworkCommand::SendMessage { to, content }).await,
            None => println!("No active chat; use /msg <user> <text> or /connect <user>"),
        },
        Input::Accept(peer) => match state.take_request(peer.as_deref()) {
            Some(request) => {
                println!("Accepted {}", request.peer());
                request.accept();
            }
            None => println!("No matching request"),
        },
        Input::Reject(peer) => match state.take_request(peer.as_deref()) {
            Some(request) => {
                println!("Rejected {}", request.peer());
                request.reject();
            }
            None => println!("No matching request"),
        },
        Input::Help => println!("{HELP}"),
        Input::Quit => {
            send(command_sender, NetworkCommand::Logout).await;
            return false;
        }
        Input::Invalid(reason) => println!("{reason}"),
    }
    true
}

async fn send(command_sender: &mpsc::Sender<NetworkCommand>, command: NetworkCommand) {
    if let Err(err) = command_sender.send(command).await {
        log::warn!("Failed to send command to network: {err}");
    }
}
