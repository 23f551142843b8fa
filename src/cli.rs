//! Command-line surface of the `stormware` binary.

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::debug;

use stormware::{default_secret_store, Context, Table};

pub type CliResult = Result<(), Box<dyn Error>>;

/// Credential resolution and cloud connectors for one organization.
#[derive(Debug, Parser)]
#[command(name = "stormware")]
#[command(version)]
pub struct Cli {
    /// Organization domain, e.g. example.com
    #[arg(long, global = true, env = "STORMWARE_ORGANIZATION")]
    pub organization: Option<String>,

    /// Project name (defaults to the discovered package name)
    #[arg(long, global = true, env = "STORMWARE_PROJECT")]
    pub project: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Read and write secrets in the default secret store
    #[command(subcommand)]
    Secret(SecretCommand),

    /// Inspect the resolved Google Cloud credentials
    #[cfg(feature = "google")]
    #[command(subcommand)]
    Gcp(GcpCommand),

    /// Inspect the resolved AWS session
    #[cfg(feature = "amazon")]
    #[command(subcommand)]
    Aws(AwsCommand),

    /// Google Drive files and folders
    #[cfg(feature = "google")]
    #[command(subcommand)]
    Drive(DriveCommand),

    /// Read-only Gmail access
    #[cfg(feature = "google")]
    #[command(subcommand)]
    Gmail(GmailCommand),

    /// Google Sheets
    #[cfg(feature = "google")]
    #[command(subcommand)]
    Sheets(SheetsCommand),

    /// BigQuery tables
    #[cfg(feature = "google")]
    #[command(subcommand)]
    Bigquery(BigQueryCommand),

    /// Facebook Ads
    #[cfg(feature = "facebook")]
    #[command(subcommand)]
    Facebook(FacebookCommand),
}

#[derive(Debug, Subcommand)]
pub enum SecretCommand {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
    Exists { key: String },
}

#[cfg(feature = "google")]
#[derive(Debug, Subcommand)]
pub enum GcpCommand {
    /// Show which credentials would be used
    Credentials {
        /// OAuth scope to request (repeatable)
        #[arg(long = "scope")]
        scopes: Vec<String>,
    },
}

#[cfg(feature = "amazon")]
#[derive(Debug, Subcommand)]
pub enum AwsCommand {
    /// Show the profile, credential source and region
    Profile {
        #[arg(long)]
        region: Option<String>,
    },
}

#[cfg(feature = "google")]
#[derive(Debug, Subcommand)]
pub enum DriveCommand {
    Exists {
        path: String,
        #[arg(long)]
        in_trash: bool,
    },
    Mkdir {
        path: String,
    },
    Remove {
        path: String,
        #[arg(long)]
        missing_ok: bool,
        /// Delete permanently instead of moving to the trash
        #[arg(long)]
        no_trash: bool,
        #[arg(long)]
        in_trash: bool,
    },
    Upload {
        src: PathBuf,
        dst: String,
        /// Fail when the destination already holds a file of the same name
        #[arg(long)]
        no_overwrite: bool,
    },
}

#[cfg(feature = "google")]
#[derive(Debug, Subcommand)]
pub enum GmailCommand {
    Labels,
    Messages(MessageQuery),
}

#[cfg(feature = "google")]
#[derive(Debug, Args)]
pub struct MessageQuery {
    /// Free text search
    #[arg(default_value = "")]
    pub text: String,
    #[arg(long)]
    pub from: Option<String>,
    #[arg(long)]
    pub to: Option<String>,
    #[arg(long)]
    pub subject: Option<String>,
    /// RFC 3339 timestamp
    #[arg(long)]
    pub after: Option<String>,
    /// RFC 3339 timestamp
    #[arg(long)]
    pub before: Option<String>,
    #[arg(long)]
    pub label: Option<String>,
    #[arg(long)]
    pub has_attachment: bool,
}

#[cfg(feature = "google")]
#[derive(Debug, Subcommand)]
pub enum SheetsCommand {
    /// Print a sheet as tab-separated values
    Get { key: String, sheet: String },
}

#[cfg(feature = "google")]
#[derive(Debug, Subcommand)]
pub enum BigQueryCommand {
    /// Print a table as tab-separated values
    Get { table: String },
}

#[cfg(feature = "facebook")]
#[derive(Debug, Subcommand)]
pub enum FacebookCommand {
    /// List the ad accounts the credentials can access
    Accounts {
        #[arg(long, default_value = stormware::facebook::DEFAULT_SECRET_KEY)]
        secret_key: String,
    },
}

// ── Dispatch ────────────────────────────────────────────────────────────

pub async fn run(cli: Cli) -> CliResult {
    let context = Context::discover(cli.organization, cli.project)?;
    debug!("Running {:?}", cli.command);

    match cli.command {
        Command::Secret(cmd) => secret(cmd, &context).await,
        #[cfg(feature = "google")]
        Command::Gcp(cmd) => gcp(cmd, &context).await,
        #[cfg(feature = "amazon")]
        Command::Aws(cmd) => aws(cmd, &context).await,
        #[cfg(feature = "google")]
        Command::Drive(cmd) => drive(cmd, &context).await,
        #[cfg(feature = "google")]
        Command::Gmail(cmd) => gmail(cmd, &context).await,
        #[cfg(feature = "google")]
        Command::Sheets(SheetsCommand::Get { key, sheet }) => {
            let auth = context.gcp_auth();
            let spreadsheet = stormware::gsheets::Spreadsheet::connect(&auth, &key, None, None).await?;
            print_table(&spreadsheet.get_sheet(&sheet).await?);
            Ok(())
        }
        #[cfg(feature = "google")]
        Command::Bigquery(BigQueryCommand::Get { table }) => {
            let auth = context.gcp_auth();
            let bigquery = stormware::gcp::BigQuery::connect(&auth, None, None).await?;
            print_table(&bigquery.get_table(&table).await?);
            Ok(())
        }
        #[cfg(feature = "facebook")]
        Command::Facebook(FacebookCommand::Accounts { secret_key }) => {
            let store = default_secret_store(None, &context).await?;
            let ads = stormware::facebook::FacebookAds::connect(store.as_ref(), &secret_key, None).await?;
            for (name, id) in ads.accounts() {
                println!("{}\t{}", name, id);
            }
            Ok(())
        }
    }
}

async fn secret(cmd: SecretCommand, context: &Context) -> CliResult {
    let store = default_secret_store(None, context).await?;
    match cmd {
        SecretCommand::Get { key } => println!("{}", store.get(&key).await?),
        SecretCommand::Set { key, value } => store.set(&key, &value).await?,
        SecretCommand::Delete { key } => store.delete(&key).await?,
        SecretCommand::Exists { key } => println!("{}", store.exists(&key).await?),
    }
    Ok(())
}

#[cfg(feature = "google")]
async fn gcp(cmd: GcpCommand, context: &Context) -> CliResult {
    let GcpCommand::Credentials { scopes } = cmd;
    let auth = context.gcp_auth();
    let scopes: Vec<&str> = scopes.iter().map(String::as_str).collect();
    let credentials = auth.credentials(None, None, &scopes).await?;

    println!("type\t{}", credentials.kind_name());
    println!("project\t{}", auth.project_id(None, None)?);
    if let Some(email) = credentials.service_account_email() {
        println!("service_account\t{}", email);
    }
    if let Some(quota) = credentials.quota_project_id() {
        println!("quota_project\t{}", quota);
    }
    if !credentials.scopes().is_empty() {
        println!("scopes\t{}", credentials.scopes().join(" "));
    }
    Ok(())
}

#[cfg(feature = "amazon")]
async fn aws(cmd: AwsCommand, context: &Context) -> CliResult {
    let AwsCommand::Profile { region } = cmd;
    let session = context
        .aws_auth()
        .await?
        .session(None, region.as_deref())
        .await?;
    println!("profile\t{}", session.profile.as_deref().unwrap_or("-"));
    println!("credentials\t{}", session.credentials.provider_name);
    println!("region\t{}", session.region.name);
    Ok(())
}

#[cfg(feature = "google")]
async fn drive(cmd: DriveCommand, context: &Context) -> CliResult {
    use stormware::gdrive::{Drive, DrivePath};

    let auth = context.gcp_auth();
    let drive = Drive::connect(&auth, None, None).await?;
    match cmd {
        DriveCommand::Exists { path, in_trash } => {
            let path: DrivePath = path.parse()?;
            println!("{}", drive.exists(&path, in_trash).await?);
        }
        DriveCommand::Mkdir { path } => {
            println!("{}", drive.mkdir(&path.parse()?).await?);
        }
        DriveCommand::Remove {
            path,
            missing_ok,
            no_trash,
            in_trash,
        } => {
            // Already-trashed files can only be deleted.
            let use_trash = !no_trash && !in_trash;
            drive.remove(&path.parse()?, missing_ok, use_trash, in_trash).await?;
        }
        DriveCommand::Upload {
            src,
            dst,
            no_overwrite,
        } => {
            println!("{}", drive.upload(&src, &dst.parse()?, !no_overwrite).await?);
        }
    }
    Ok(())
}

#[cfg(feature = "google")]
async fn gmail(cmd: GmailCommand, context: &Context) -> CliResult {
    use stormware::gmail::{Gmail, Query};

    let auth = context.gcp_auth();
    let gmail = Gmail::connect(&auth, None, None).await?;
    match cmd {
        GmailCommand::Labels => {
            for label in gmail.labels().await? {
                println!("{}\t{}", label.id, label.name.as_deref().unwrap_or(""));
            }
        }
        GmailCommand::Messages(args) => {
            let query = Query {
                text: args.text,
                sender: args.from,
                to: args.to,
                subject: args.subject,
                timestamp_from: args.after.as_deref().map(parse_timestamp).transpose()?,
                timestamp_to: args.before.as_deref().map(parse_timestamp).transpose()?,
                label: args.label,
                attachment: args.has_attachment,
                ..Query::default()
            };
            for message in gmail.messages(&query).await? {
                let message = gmail.message(&message).await?;
                let sender = message.sender.map(|a| a.to_string()).unwrap_or_default();
                let timestamp = message.timestamp.map(|t| t.to_rfc3339()).unwrap_or_default();
                println!(
                    "{}\t{}\t{}\t{}",
                    message.id,
                    timestamp,
                    sender,
                    message.subject.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

#[cfg(feature = "google")]
fn parse_timestamp(value: &str) -> Result<chrono::DateTime<chrono::Utc>, chrono::ParseError> {
    Ok(chrono::DateTime::parse_from_rfc3339(value)?.with_timezone(&chrono::Utc))
}

fn print_table(table: &Table) {
    println!("{}", table.columns().join("\t"));
    for row in table.rows() {
        let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
        println!("{}", cells.join("\t"));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stormware",
            "secret",
            "get",
            "token",
            "--organization",
            "example.com",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.organization.as_deref(), Some("example.com"));
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::Secret(SecretCommand::Get { ref key }) if key == "token"));
    }

    #[test]
    fn secret_set_requires_value() {
        assert!(Cli::try_parse_from(["stormware", "secret", "set", "token"]).is_err());
    }

    #[cfg(feature = "google")]
    #[test]
    fn drive_remove_flags() {
        let cli = Cli::try_parse_from([
            "stormware",
            "drive",
            "remove",
            "//Shared/reports/old.csv",
            "--missing-ok",
            "--no-trash",
        ])
        .unwrap();
        match cli.command {
            Command::Drive(DriveCommand::Remove {
                path,
                missing_ok,
                no_trash,
                in_trash,
            }) => {
                assert_eq!(path, "//Shared/reports/old.csv");
                assert!(missing_ok && no_trash && !in_trash);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[cfg(feature = "google")]
    #[test]
    fn drive_defaults_trash_and_overwrite() {
        let cli = Cli::try_parse_from(["stormware", "drive", "remove", "/reports/old.csv"]).unwrap();
        let Command::Drive(DriveCommand::Remove { no_trash, .. }) = cli.command else {
            panic!("expected drive remove");
        };
        assert!(!no_trash);

        let cli = Cli::try_parse_from(["stormware", "drive", "upload", "report.csv", "/reports"]).unwrap();
        let Command::Drive(DriveCommand::Upload { no_overwrite, .. }) = cli.command else {
            panic!("expected drive upload");
        };
        assert!(!no_overwrite);

        assert!(Cli::try_parse_from(["stormware", "drive", "remove", "/x/y", "--trash"]).is_err());
    }

    #[cfg(feature = "google")]
    #[test]
    fn gmail_query_flags() {
        let cli = Cli::try_parse_from([
            "stormware",
            "gmail",
            "messages",
            "invoice",
            "--from",
            "billing@example.com",
            "--after",
            "2024-01-01T00:00:00Z",
            "--has-attachment",
        ])
        .unwrap();
        let Command::Gmail(GmailCommand::Messages(args)) = cli.command else {
            panic!("expected gmail messages");
        };
        assert_eq!(args.text, "invoice");
        assert_eq!(args.from.as_deref(), Some("billing@example.com"));
        assert!(args.has_attachment);
        assert_eq!(
            parse_timestamp(args.after.as_deref().unwrap()).unwrap().timestamp(),
            1_704_067_200
        );
    }

    #[cfg(feature = "google")]
    #[test]
    fn parse_timestamp_rejects_garbage() {
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[cfg(feature = "facebook")]
    #[test]
    fn facebook_secret_key_default() {
        let cli = Cli::try_parse_from(["stormware", "facebook", "accounts"]).unwrap();
        let Command::Facebook(FacebookCommand::Accounts { secret_key }) = cli.command else {
            panic!("expected facebook accounts");
        };
        assert_eq!(secret_key, stormware::facebook::DEFAULT_SECRET_KEY);
    }
}
