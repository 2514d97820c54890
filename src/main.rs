use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::core::{
    db::DrawDb,
    engine::DrawEngine,
    participant::{ParticipantRef, Picker},
    settings::Settings,
};

mod core;
mod error;
mod util;

#[derive(Parser, Debug)]
#[command(name = "santadraw")]
#[command(version = "0.1")]
#[command(about = "Anonymous name drawing for gift exchanges.", long_about = None)]
struct Args {
    /// Location of the settings file.
    #[arg(short, long, default_value = "santadraw.json")]
    settings: PathBuf,

    #[command(subcommand)]
    command: RunType,
}

#[derive(Subcommand, Debug)]
enum RunType {
    /// Create the settings file and initialize the database it points to.
    Init {
        /// Location of the SQLite database.
        database: PathBuf,
    },

    /// Create a new session and print its invite code.
    CreateSession { name: String },

    /// Find a session by its invite code.
    Invite { code: String },

    /// Open or close a session for picking.
    SetActive {
        session: i64,
        #[arg(action = clap::ArgAction::Set)]
        active: bool,
    },

    /// Add someone to a session. Joining twice with the same email is harmless.
    Join {
        session: i64,
        name: String,
        email: String,
    },

    /// List the participants of a session. Assignments are never shown.
    Participants { session: i64 },

    /// List the participants nobody has drawn yet.
    Available { session: i64 },

    /// Draw a recipient.
    Pick {
        session: i64,

        /// Participant ID, if already registered. Name and email are not needed then.
        #[arg(short, long)]
        id: Option<i64>,

        #[arg(required_unless_present = "id")]
        name: Option<String>,

        #[arg(required_unless_present = "id")]
        email: Option<String>,
    },

    /// Show who a participant gives to, by email or ID.
    Lookup { session: i64, participant: String },

    /// Remove a participant, relinking whoever drew them.
    Remove { participant: i64 },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Loads settings and opens the database they point to.
async fn open(settings_file: &Path) -> anyhow::Result<(Arc<Settings>, DrawEngine)> {
    let settings = Arc::new(Settings::load(settings_file)?);
    let db = Arc::new(DrawDb::load(&settings).await?);
    Ok((settings.clone(), DrawEngine::new(db, settings)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let settings_file = args.settings;

    match args.command {
        RunType::Init { database } => {
            let settings = Settings::new(database);
            DrawDb::init(&settings).await?;
            fs::write(&settings_file, serde_json::to_string_pretty(&settings)?)?;

            println!(
                "Database initialized, settings saved to {}.",
                settings_file.display()
            );
            Ok(())
        }
        RunType::CreateSession { name } => {
            let (settings, engine) = open(&settings_file).await?;
            let session = engine
                .db()
                .create_session(&name, settings.invite_code_length())
                .await?;
            print_json(&session)
        }
        RunType::Invite { code } => {
            let (_, engine) = open(&settings_file).await?;
            match engine.db().find_session_by_invite_code(&code).await? {
                Some(session) => print_json(&session),
                None => {
                    println!("No session uses invite code {}.", code);
                    Ok(())
                }
            }
        }
        RunType::SetActive { session, active } => {
            let (_, engine) = open(&settings_file).await?;
            engine.db().set_session_active(session, active).await?;
            println!("Session {} is now {}.", session, if active { "open" } else { "closed" });
            Ok(())
        }
        RunType::Join {
            session,
            name,
            email,
        } => {
            let (_, engine) = open(&settings_file).await?;
            print_json(&engine.db().join_session(session, &name, &email).await?)
        }
        RunType::Participants { session } => {
            let (_, engine) = open(&settings_file).await?;
            print_json(&engine.db().list_participants(session).await?)
        }
        RunType::Available { session } => {
            let (_, engine) = open(&settings_file).await?;
            print_json(&engine.db().list_available_recipients(session).await?)
        }
        RunType::Pick {
            session,
            id,
            name,
            email,
        } => {
            let (_, engine) = open(&settings_file).await?;
            let picker = Picker {
                id,
                name: name.unwrap_or_default(),
                email: email.unwrap_or_default(),
            };
            print_json(&engine.pick(session, &picker).await?)
        }
        RunType::Lookup {
            session,
            participant,
        } => {
            let (_, engine) = open(&settings_file).await?;
            let participant = ParticipantRef::from(participant.as_str());
            match engine.get_assignment(session, &participant).await? {
                Some(recipient) => print_json(&recipient),
                None => {
                    println!("{} has no assignment in session {}.", participant, session);
                    Ok(())
                }
            }
        }
        RunType::Remove { participant } => {
            let (_, engine) = open(&settings_file).await?;
            engine.remove_participant(participant).await?;
            println!("Participant {} removed.", participant);
            Ok(())
        }
    }
}
