//! Subcommand handlers. Each one goes through the `SessionManager`;
//! API errors are shown with the message the client classified them with.

use std::io::{self, Write};

use anyhow::{Context, Result};
use tracing::warn;

use vocabdeck_core::{
    ApiError, Config, LoginRequest, RegisterRequest, SessionManager, Vocabulary, VocabularyRequest,
};

use crate::Command;

/// Environment variable read before prompting for a password
const PASSWORD_ENV: &str = "VOCABDECK_PASSWORD";

pub async fn run(command: Command, session: &SessionManager, config: &Config) -> Result<()> {
    match command {
        Command::Login { username } => {
            let username = match username.or_else(|| config.last_username.clone()) {
                Some(u) if !u.is_empty() => u,
                _ => prompt_username()?,
            };
            let password = read_password()?;

            let user = session.login(&LoginRequest::new(&username, password)).await?;
            remember_username(&username);
            println!("Logged in as {} ({})", user.full_name(), user.username);
        }
        Command::Register {
            first_name,
            last_name,
            username,
            email,
        } => {
            let password = read_password()?;
            let data = RegisterRequest {
                first_name,
                last_name,
                username,
                email,
                password,
            };
            let user = session.register(&data).await?;
            remember_username(&user.username);
            println!("Registered and logged in as {}", user.username);
        }
        Command::Logout => {
            session.logout().await;
        }
        Command::Whoami => match session.user() {
            Some(user) => println!("{} <{}> ({})", user.full_name(), user.email, user.username),
            None => println!("Not logged in"),
        },
        Command::List { page, size } => {
            let page = require_session(session.api().fetch_vocabulary(page, size).await)?;
            if page.empty {
                println!("No vocabulary on this page.");
            }
            for vocab in &page.content {
                println!("{:>6}  {:<24} {}", vocab.id, vocab.word, vocab.definition_display());
            }
            println!(
                "Page {} of {} ({} total)",
                page.number + 1,
                page.total_pages.max(1),
                page.total_elements
            );
        }
        Command::Show { id } => {
            let vocab = require_session(session.api().fetch_vocabulary_item(id).await)?;
            print_card(&vocab);
        }
        Command::Add {
            word,
            definition,
            example,
        } => {
            let request = build_request(word, definition, example);
            let vocab = require_session(session.api().create_vocabulary(&request).await)?;
            println!("Added #{}", vocab.id);
            print_card(&vocab);
        }
        Command::Edit {
            id,
            word,
            definition,
            example,
        } => {
            let request = build_request(word, definition, example);
            let vocab = require_session(session.api().update_vocabulary(id, &request).await)?;
            print_card(&vocab);
        }
        Command::Delete { id } => {
            require_session(session.api().delete_vocabulary(id).await)?;
            println!("Deleted #{}", id);
        }
    }
    Ok(())
}

/// Session-ending errors have already signed the user out; say so plainly.
fn require_session<T>(result: Result<T, ApiError>) -> Result<T> {
    result.map_err(|e| {
        if e.is_session_ending() {
            anyhow::anyhow!("{} (please log in again)", e)
        } else {
            e.into()
        }
    })
}

fn build_request(word: String, definition: Option<String>, example: Option<String>) -> VocabularyRequest {
    VocabularyRequest {
        word,
        definition,
        example,
    }
}

fn print_card(vocab: &Vocabulary) {
    println!("{}", vocab.word);
    println!("  {}", vocab.definition_display());
    if let Some(example) = vocab.example.as_deref().filter(|e| !e.is_empty()) {
        println!("  e.g. {}", example);
    }
}

/// Remember the username for next time. Failure only costs a prompt.
fn remember_username(username: &str) {
    let result = Config::load_file().and_then(|mut saved| {
        saved.last_username = Some(username.to_string());
        saved.save()
    });
    if let Err(e) = result {
        warn!(error = %e, "Failed to save config");
    }
}

fn prompt_username() -> Result<String> {
    print!("Username: ");
    io::stdout().flush()?;

    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    let username = username.trim().to_string();
    if username.is_empty() {
        anyhow::bail!("Username required");
    }
    Ok(username)
}

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        if !password.is_empty() {
            return Ok(password);
        }
    }
    rpassword::prompt_password("Password: ").context("Failed to read password")
}
