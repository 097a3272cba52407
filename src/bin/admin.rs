use clap::Parser;
use std::{env::VarError, error::Error};

use factshield::db;

/// Out-of-band management tool, mainly to seed the accounts that can log
/// into the admin dashboard.
#[derive(Debug, Parser)]
#[clap(version, author, about)]
struct Opts {
    #[clap(subcommand)]
    cmd: SubCommand,
}

#[derive(Debug, Parser)]
enum SubCommand {
    /// Create a user able to log into the admin dashboard
    GenUser {
        #[clap(short, long)]
        username: String,

        #[clap(short, long)]
        password: String,

        /// defaults to DATABASE_URL env variable if not provided
        #[clap(short, long)]
        database_url: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    match Opts::parse().cmd {
        SubCommand::GenUser {
            username,
            password,
            database_url,
        } => gen_user(database_url, username, password),
    }
}

fn gen_user(
    database_url: Option<String>,
    username: String,
    password: String,
) -> Result<(), Box<dyn Error>> {
    let db_url = get_db_url(database_url)?;
    let conn = db::connect(&db_url)?;
    db::create_user(&conn, &username, &password)?;
    println!("created user {}", username);
    Ok(())
}

fn get_db_url(database_url: Option<String>) -> Result<String, Box<dyn Error>> {
    match database_url {
        Some(x) => Ok(x),
        None => match std::env::var("DATABASE_URL") {
            Ok(x) => Ok(x),
            Err(VarError::NotPresent) => Err("DATABASE_URL env var not found".into()),
            Err(VarError::NotUnicode(_)) => Err("DATABASE_URL env var not valid unicode".into()),
        },
    }
}
