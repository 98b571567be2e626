use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use messaging_core::{
    load_settings, InMemoryBlobUrls, MessagingClient, MissingMediaDevices, Recipient,
};
use shared::{
    domain::{ConversationId, ProfileId},
    protocol::{LastMessageSummary, TeamMember},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `api_base_url` from messaging.toml and the environment.
    #[arg(long)]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists conversations, most recent first.
    Conversations,
    Messages {
        conversation_id: String,
    },
    Send {
        conversation_id: String,
        text: String,
    },
    /// Uploads a file and sends it, optionally with a caption.
    Attach {
        conversation_id: String,
        path: PathBuf,
        #[arg(long)]
        text: Option<String>,
    },
    Start {
        participant_id: String,
    },
    Members,
    /// Sends a personalized copy of a template to each listed team member.
    Broadcast {
        template: String,
        #[arg(long = "to", required = true)]
        recipients: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_url) = args.api_url {
        settings.api_base_url = api_url;
    }
    let client = MessagingClient::connect(
        &settings,
        Arc::new(MissingMediaDevices),
        InMemoryBlobUrls::new(),
    )?;

    let outcome = run(&client, args.command).await;
    client.composer.teardown().await;
    outcome
}

async fn run(client: &MessagingClient, command: Command) -> Result<()> {
    match command {
        Command::Conversations => {
            client.conversations.refresh().await?;
            for conversation in client.conversations.list().await {
                let title = conversation
                    .participant
                    .as_ref()
                    .map(|participant| participant.display_name())
                    .unwrap_or_else(|| conversation.id.to_string());
                let preview = conversation
                    .last_message
                    .as_ref()
                    .map(LastMessageSummary::preview_text)
                    .unwrap_or_default();
                println!(
                    "{}\t{}\t({} unread)\t{}",
                    conversation.id, title, conversation.unread_count, preview
                );
            }
            println!("total unread: {}", client.conversations.total_unread().await);
        }
        Command::Messages { conversation_id } => {
            let id = ConversationId::new(conversation_id);
            client.conversations.select(&id).await?;
            for message in client.messages.messages().await {
                let who = if client.messages.is_own(&message).await {
                    "you".to_string()
                } else {
                    message.sender_id.to_string()
                };
                println!(
                    "[{}] {}: {} ({:?})",
                    message.created_at.format("%Y-%m-%d %H:%M"),
                    who,
                    LastMessageSummary::from(&message).preview_text(),
                    message.status
                );
            }
        }
        Command::Send {
            conversation_id,
            text,
        } => {
            let id = ConversationId::new(conversation_id);
            client.composer.set_text(text).await;
            let message = client.composer.send(&id).await?;
            println!("{}", serde_json::to_string_pretty(&message)?);
        }
        Command::Attach {
            conversation_id,
            path,
            text,
        } => {
            let id = ConversationId::new(conversation_id);
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let file_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))?
                .to_string();
            let mime_type = mime_guess::from_path(&path)
                .first_or_octet_stream()
                .essence_str()
                .to_string();
            let staged = client
                .composer
                .attach_file(data, file_name, mime_type)
                .await?;
            info!(file_name = %staged.file_name, size = staged.size, "inbox: attachment staged");
            if let Some(text) = text {
                client.composer.set_text(text).await;
            }
            let message = client.composer.send(&id).await?;
            println!("{}", serde_json::to_string_pretty(&message)?);
        }
        Command::Start { participant_id } => {
            client.conversations.refresh().await?;
            let id = client
                .conversations
                .start_with(&ProfileId::new(participant_id))
                .await?;
            println!("{id}");
        }
        Command::Members => {
            client.conversations.refresh().await?;
            let members = client.conversations.candidates().await?;
            println!("{}", serde_json::to_string_pretty(&members)?);
        }
        Command::Broadcast {
            template,
            recipients,
        } => {
            client.conversations.refresh().await?;
            let team = client.conversations.team_members().await?;
            for (profile_id, recipient) in resolve_recipients(&team, &recipients)? {
                let id = client.conversations.start_with(&profile_id).await?;
                client.composer.apply_template(&template, &recipient).await;
                let message = client.composer.send(&id).await?;
                println!("{profile_id}\t{id}\t{}", message.id);
            }
        }
    }
    Ok(())
}

/// Looks every id up in the team list; nothing is sent if any id is unknown.
fn resolve_recipients(
    team: &[TeamMember],
    recipient_ids: &[String],
) -> Result<Vec<(ProfileId, Recipient)>> {
    let unknown: Vec<&str> = recipient_ids
        .iter()
        .filter(|id| !team.iter().any(|member| member.id.as_str() == id.as_str()))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(anyhow!("not team members: {}", unknown.join(", ")));
    }
    Ok(recipient_ids
        .iter()
        .filter_map(|id| team.iter().find(|member| member.id.as_str() == id.as_str()))
        .map(|member| (member.id.clone(), Recipient::from(member)))
        .collect())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
