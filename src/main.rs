use anyhow::{Context, Result};
use std::env;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use briefkasten::store::MessageKey;
use briefkasten::{Account, Config, MessageFlags};

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,briefkasten=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_usage() {
    eprintln!(
        r#"briefkasten - local IMAP mirror

Usage: briefkasten <command> [args]

Commands:
    sync <account> [folder...]        Sync all folders, or just the given ones
    search <account> <query...>       Fulltext search across the account
    folders <account>                 List mirrored folders
    messages <account> <folder> [n]   List up to n messages of a folder
    read <account> <folder> <uid>     Show one message
    history <account>                 List composite snapshots, newest first
    flag <account> <folder> <uid> [+|-]<flag>...
                                      Add/remove flags (seen, answered,
                                      flagged, deleted, draft)
    expunge <account> <folder>        Expunge the folder on the server
    help                              Show this help message

Configuration file: $BRIEFKASTEN_CONFIG or ~/.config/briefkasten/config.toml
"#
    );
}

async fn run_sync(account_id: &str, folders: &[String]) -> Result<()> {
    let config = Config::load()?;
    let mut account = Account::open(&config, account_id).await?;

    let folder_arg = if folders.is_empty() {
        None
    } else {
        Some(folders)
    };
    let results = account.sync(folder_arg).await?;
    for (folder, outcome) in &results {
        println!("{}: {}", folder, serde_json::to_string(outcome)?);
    }

    account.close().await
}

async fn run_search(account_id: &str, query: &str) -> Result<()> {
    let config = Config::load()?;
    let account = Account::open(&config, account_id).await?;

    let hits = account.search(query, 0).await?;
    if hits.is_empty() {
        println!("No results.");
    }
    for hit in hits {
        println!(
            "{:8.3}  {}/{}  {}  ({})",
            hit.score, hit.folder, hit.uid, hit.subject, hit.from_addr
        );
    }

    account.close().await
}

async fn run_folders(account_id: &str) -> Result<()> {
    let config = Config::load()?;
    let account = Account::open(&config, account_id).await?;

    for folder in account.list_folders().await? {
        let count = account.message_count(&folder).await?;
        println!("{}  ({} messages)", folder, count);
    }

    account.close().await
}

async fn run_messages(account_id: &str, folder: &str, limit: Option<usize>) -> Result<()> {
    let config = Config::load()?;
    let account = Account::open(&config, account_id).await?;

    for record in account.list_messages(folder, limit).await? {
        let seen = if record.flags.contains(MessageFlags::SEEN) {
            ' '
        } else {
            '*'
        };
        println!(
            "{}{:>6}  {}  {}",
            seen, record.uid, record.subject, record.from_addr
        );
    }

    account.close().await
}

async fn run_read(account_id: &str, folder: &str, uid: u32) -> Result<()> {
    let config = Config::load()?;
    let account = Account::open(&config, account_id).await?;

    match account.read_message(folder, &MessageKey::Uid(uid)).await? {
        Some((record, attachments)) => {
            println!("Subject: {}", record.subject);
            println!("From: {}", record.from_addr);
            if let Some(to) = &record.to_addr {
                println!("To: {}", to);
            }
            if let Some(cc) = &record.cc_addr {
                println!("Cc: {}", cc);
            }
            println!("Flags: {}", record.flags.names().join(", "));
            for att in attachments {
                println!(
                    "Attachment: {} ({}, {} bytes)",
                    att.filename, att.content_type, att.size
                );
            }
            if record.eml_path.is_some() {
                let raw = account.read_eml(folder, uid).await?;
                println!();
                println!("{}", String::from_utf8_lossy(&raw));
            }
        }
        None => println!("No message {} in '{}'", uid, folder),
    }

    account.close().await
}

async fn run_history(account_id: &str) -> Result<()> {
    let config = Config::load()?;
    let account = Account::open(&config, account_id).await?;

    for id in account.composite().history() {
        let meta = account
            .composite()
            .snapshot_meta(&id)
            .with_context(|| format!("missing snapshot metadata for {}", id))?;
        println!("{}  {}  {}", &id[..12], meta.created_at, meta.message);
    }

    account.close().await
}

fn parse_flag_args(args: &[String]) -> Result<(MessageFlags, MessageFlags)> {
    let mut add = MessageFlags::empty();
    let mut remove = MessageFlags::empty();
    for arg in args {
        let (target, name) = if let Some(name) = arg.strip_prefix('+') {
            (&mut add, name)
        } else if let Some(name) = arg.strip_prefix('-') {
            (&mut remove, name)
        } else {
            (&mut add, arg.as_str())
        };
        let flag = MessageFlags::from_persisted_name(name)
            .ok_or_else(|| anyhow::anyhow!("unknown flag '{}'", name))?;
        *target |= flag;
    }
    Ok((add, remove))
}

async fn run_flag(account_id: &str, folder: &str, uid: u32, flag_args: &[String]) -> Result<()> {
    let (add, remove) = parse_flag_args(flag_args)?;
    let config = Config::load()?;
    let account = Account::open(&config, account_id).await?;
    account.set_flags(folder, uid, add, remove).await?;
    println!("Updated flags of {}/{}", folder, uid);
    account.close().await
}

async fn run_expunge(account_id: &str, folder: &str) -> Result<()> {
    let config = Config::load()?;
    let account = Account::open(&config, account_id).await?;
    account.expunge(folder).await?;
    println!("Expunged '{}'", folder);
    account.close().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    let command = args.get(1).map(|s| s.as_str());
    if matches!(command, Some("help") | Some("--help") | Some("-h") | None) {
        print_usage();
        return Ok(());
    }

    setup_logging();

    match (command, args.get(2)) {
        (Some("sync"), Some(account)) => run_sync(account, &args[3..]).await,
        (Some("search"), Some(account)) if args.len() > 3 => {
            run_search(account, &args[3..].join(" ")).await
        }
        (Some("folders"), Some(account)) => run_folders(account).await,
        (Some("messages"), Some(account)) if args.len() > 3 => {
            let limit = args.get(4).and_then(|s| s.parse().ok());
            run_messages(account, &args[3], limit).await
        }
        (Some("read"), Some(account)) if args.len() > 4 => {
            let uid = args[4].parse()?;
            run_read(account, &args[3], uid).await
        }
        (Some("history"), Some(account)) => run_history(account).await,
        (Some("flag"), Some(account)) if args.len() > 5 => {
            let uid = args[4].parse()?;
            run_flag(account, &args[3], uid, &args[5..]).await
        }
        (Some("expunge"), Some(account)) if args.len() > 3 => {
            run_expunge(account, &args[3]).await
        }
        (Some(cmd), _) => {
            eprintln!("Unknown or incomplete command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
        (None, _) => unreachable!(),
    }
}
