use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatline::config::{AppSettings, load_settings};
use chatline::error::Result as AppResult;
use chatline::twitch::{
    ChannelMessage, FollowResult, HelixClient, TwitchAccount, TwitchApi, TwitchChannel,
    TwitchServer,
};

fn build_account(settings: &AppSettings, api: Arc<dyn TwitchApi>) -> TwitchAccount {
    let account = &settings.account;
    let account = if account.is_anonymous() {
        TwitchAccount::anonymous(api)
    } else {
        TwitchAccount::new(
            account.username.clone().unwrap_or_default(),
            account.oauth_token.clone().unwrap_or_default(),
            account.client_id.clone().unwrap_or_default(),
            account.user_id.clone().unwrap_or_default(),
            api,
        )
    };
    account.with_userstate_reload_interval(settings.emotes.userstate_reload_interval())
}

/// Prints everything posted to a channel until the channel goes away.
fn spawn_printer(channel: Arc<TwitchChannel>) {
    let mut rx = channel.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ChannelMessage::Chat(msg)) if msg.is_action => {
                    println!("[{}] * {} {}", channel.name(), msg.sender_display_name, msg.text)
                }
                Ok(ChannelMessage::Chat(msg)) => {
                    println!("[{}] {}: {}", channel.name(), msg.sender_display_name, msg.text)
                }
                Ok(ChannelMessage::System { text, .. }) => println!("[{}] {}", channel.name(), text),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel.name = %channel.name(), skipped, "Printer lagged behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn join(server: &TwitchServer, name: &str) -> Option<String> {
    let known = server.get_channel(name).is_some();
    let channel = server.get_or_add_channel(name);
    if channel.is_empty_channel() {
        return None;
    }
    if !known {
        spawn_printer(Arc::clone(&channel));
    }
    Some(channel.name().to_string())
}

async fn handle_command(server: &Arc<TwitchServer>, current: &mut Option<String>, line: &str) {
    let account = server.account();
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default();
    let arg = words.next().unwrap_or_default();

    let result = match command {
        "/join" => {
            *current = join(server, arg).or(current.take());
            Ok(())
        }
        "/part" => {
            let name = match arg {
                "" => current.clone().unwrap_or_default(),
                _ => TwitchServer::clean_channel_name(arg),
            };
            if server.part_channel(&name) && current.as_deref() == Some(name.as_str()) {
                *current = server.channel_names().into_iter().next();
            }
            Ok(())
        }
        "/block" => account.block_user(arg).await,
        "/unblock" => account.unblock_user(arg).await,
        "/follows" => {
            match account.check_follow(arg).await {
                FollowResult::Following => println!("{} follows {}", account, arg),
                FollowResult::NotFollowing => println!("{} does not follow {}", account, arg),
                FollowResult::Failed => println!("Could not check follow state of {}", arg),
            }
            Ok(())
        }
        "/automod" => match (arg, words.next()) {
            ("allow", Some(msg_id)) => account.automod_allow(msg_id).await,
            ("deny", Some(msg_id)) => account.automod_deny(msg_id).await,
            _ => {
                println!("usage: /automod allow|deny <message id>");
                Ok(())
            }
        },
        "/emotes" => {
            let emotes = account.access_emotes();
            println!(
                "{} Twitch emotes in {} sets, {} BTTV, {} FFZ",
                emotes.emotes.len(),
                emotes.emote_sets.len(),
                server.bttv_emotes().global().len(),
                server.ffz_emotes().global().len()
            );
            Ok(())
        }
        _ if command.starts_with('/') => {
            println!("unknown command {}", command);
            Ok(())
        }
        _ => match current.as_deref() {
            Some(channel) => server.try_send(channel, line),
            None => {
                println!("join a channel first");
                Ok(())
            }
        },
    };

    if let Err(e) = result {
        // Throttle warnings already went to the channel.
        if !e.is_throttled() {
            println!("{}", e);
        }
        tracing::debug!(command, error = %e, "Command failed");
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_PKG_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = load_settings()?;
    tracing::info!(
        irc.host = %settings.irc.host,
        irc.single_connection = settings.irc.single_connection,
        anonymous = settings.account.is_anonymous(),
        "Configuration loaded"
    );

    let api: Arc<dyn TwitchApi> = Arc::new(HelixClient::new(settings.api.helix_url.clone()));
    let account = Arc::new(build_account(&settings, api));
    let server = TwitchServer::new(settings.server_settings()?, Arc::clone(&account));

    if !account.is_anon() {
        let (blocks, emotes) = tokio::join!(account.load_blocks(), account.load_emotes());
        if let Err(e) = blocks {
            tracing::warn!(error = %e, "Failed to load blocked users");
        }
        if let Err(e) = emotes {
            tracing::warn!(error = %e, "Failed to load emotes");
        }
    }
    server.load_global_emotes().await;

    let mut current = None;
    for channel in &settings.irc.channels {
        current = join(&server, channel).or(current);
    }
    spawn_printer(server.whispers_channel());
    spawn_printer(server.mentions_channel());

    let handle = server.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/quit" => break,
                Some(line) if line.trim().is_empty() => {}
                Some(line) => handle_command(&server, &mut current, line.trim()).await,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
