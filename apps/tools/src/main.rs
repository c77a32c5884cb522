use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::domain::{ConversationId, ConversationType, ParticipantRole, PropertyId, UserId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
    },
    CreateConversation {
        /// direct, group or support
        #[arg(long, default_value = "direct")]
        kind: ConversationType,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        property_id: Option<i64>,
    },
    AddParticipant {
        conversation_id: i64,
        user_id: i64,
        /// landlord, renter, agent or admin
        role: ParticipantRole,
        #[arg(long)]
        business_name: Option<String>,
    },
    Leave {
        conversation_id: i64,
        user_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser {
            username,
            first_name,
            last_name,
        } => {
            let user_id = storage
                .create_user_with_name(&username, first_name.as_deref(), last_name.as_deref())
                .await?;
            println!("user_id={user_id}");
        }
        Command::CreateConversation {
            kind,
            title,
            property_id,
        } => {
            let conversation_id = storage
                .create_conversation(kind, title.as_deref(), property_id.map(PropertyId))
                .await?;
            println!("created conversation_id={conversation_id}");
        }
        Command::AddParticipant {
            conversation_id,
            user_id,
            role,
            business_name,
        } => {
            storage
                .add_participant(
                    ConversationId(conversation_id),
                    UserId(user_id),
                    role,
                    business_name.as_deref(),
                )
                .await?;
            println!("user {user_id} joined conversation {conversation_id} as {}", role.as_str());
        }
        Command::Leave {
            conversation_id,
            user_id,
        } => {
            if !storage
                .leave_conversation(ConversationId(conversation_id), UserId(user_id))
                .await?
            {
                bail!("user {user_id} is not an active participant of conversation {conversation_id}");
            }
            println!("user {user_id} left conversation {conversation_id}");
        }
    }

    Ok(())
}
