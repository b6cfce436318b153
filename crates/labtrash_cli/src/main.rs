//! `labtrash` command-line entry point.
//!
//! # Responsibility
//! - Map subcommands onto `labtrash_core` services.
//! - Build the caller session from `--actor`/role flags.
//! - Render results as tab-separated text or JSON.

use clap::{Parser, Subcommand, ValueEnum};
use labtrash_core::{
    init_from_config, load_config_or_default, open_db_with_busy_timeout, Config, ConfigError,
    DbError, DeletionId, DeletionListQuery, DeletionService, DeletionTransaction, EdgeKind,
    Entity, EntityKind, EntityListQuery, EntityService, NewEntity, PermId, Role, Session,
    TrashError,
};
use log::info;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::process;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Trash and restore laboratory entities.
#[derive(Parser)]
#[command(name = "labtrash", version, about = "Trash and restore laboratory entities")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding config and LABTRASH_DB
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Acting user recorded in the ledger
    #[arg(long, global = true, default_value = "cli")]
    actor: String,

    /// Role granted on every space and on materials
    #[arg(long, global = true, value_parser = parse_role)]
    instance_role: Option<Role>,

    /// Role granted on one space, as SPACE=ROLE (repeatable)
    #[arg(long = "space-role", global = true, value_parser = parse_space_role)]
    space_roles: Vec<(String, Role)>,

    /// Description appended to authorization failures
    #[arg(long, global = true)]
    context: Option<String>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the database
    Init,

    /// Create one entity
    Create {
        /// space|experiment|sample|dataset|material
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,
        code: String,
        /// Owning space code (omit for materials and spaces)
        #[arg(long)]
        space: Option<String>,
        /// Property as KEY=VALUE (repeatable)
        #[arg(long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,
        /// Parent as EDGE_KIND=PERM_ID (repeatable)
        #[arg(long = "parent", value_parser = parse_parent)]
        parents: Vec<(EdgeKind, PermId)>,
    },

    /// Move entities and their dependents to the trash
    Delete {
        #[arg(required = true)]
        ids: Vec<PermId>,
        #[arg(long)]
        reason: String,
    },

    /// Restore every entity owned by the given deletions
    Revert {
        #[arg(required = true)]
        deletion_ids: Vec<DeletionId>,
    },

    /// Show entities by id, or search when no id is given
    List {
        ids: Vec<PermId>,
        #[arg(long)]
        include_deleted: bool,
        #[arg(long, value_parser = parse_kind)]
        kind: Option<EntityKind>,
        #[arg(long)]
        space: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show the deletion ledger
    Deletions {
        /// Show one deletion only
        #[arg(long)]
        id: Option<DeletionId>,
        #[arg(long)]
        include_reverted: bool,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Create { .. } => "create",
            Self::Delete { .. } => "delete",
            Self::Revert { .. } => "revert",
            Self::List { .. } => "list",
            Self::Deletions { .. } => "deletions",
        }
    }
}

#[derive(Debug)]
enum CliError {
    Config(ConfigError),
    Logging(String),
    Db(DbError),
    Trash(TrashError),
    Usage(String),
}

impl CliError {
    fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Logging(_) => "logging",
            Self::Db(_) => "storage",
            Self::Trash(err) => err.code(),
            Self::Usage(_) => "usage",
        }
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Logging(message) => write!(f, "{message}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Trash(err) => write!(f, "{err}"),
            Self::Usage(message) => write!(f, "{message}"),
        }
    }
}

impl Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<DbError> for CliError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<TrashError> for CliError {
    fn from(value: TrashError) -> Self {
        Self::Trash(value)
    }
}

fn main() {
    let cli = Cli::parse();
    let output = cli.output;
    if let Err(err) = run(cli) {
        match output {
            OutputFormat::Text => eprintln!("error: {err}"),
            OutputFormat::Json => {
                let body = serde_json::json!({ "error": err.code(), "message": err.to_string() });
                eprintln!("{body}");
            }
        }
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = load_config_or_default(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }
    start_logging(&config)?;
    info!("event=cli_run module=cli status=start command={}", cli.command.name());

    let conn = open_db_with_busy_timeout(&config.database_path, config.busy_timeout())?;
    let session = build_session(&cli);
    let entities = EntityService::new(&conn);
    let deletions = DeletionService::new(&conn);

    match cli.command {
        Commands::Init => {
            let version = labtrash_core::db::migrations::latest_version();
            match cli.output {
                OutputFormat::Text => println!(
                    "initialized {} (schema {version})",
                    config.database_path.display()
                ),
                OutputFormat::Json => print_json(&serde_json::json!({
                    "database": config.database_path.display().to_string(),
                    "schema_version": version,
                }))?,
            }
        }
        Commands::Create {
            kind,
            code,
            space,
            properties,
            parents,
        } => {
            let mut request = NewEntity::new(kind, code);
            request.space = space;
            request.properties = properties.into_iter().collect();
            request.parents = parents.into_iter().map(|(kind, id)| (id, kind)).collect();
            let entity = entities.create_entity(&session, request)?;
            print_entities(cli.output, &[entity])?;
        }
        Commands::Delete { ids, reason } => {
            let deletion_id = deletions.delete_entities(&session, &ids, &reason)?;
            let deletion = deletions.get_deletion(&session, deletion_id)?;
            print_deletions(cli.output, &[deletion])?;
        }
        Commands::Revert { deletion_ids } => {
            deletions.revert_deletions(&session, &deletion_ids)?;
            match cli.output {
                OutputFormat::Text => {
                    for deletion_id in &deletion_ids {
                        println!("reverted {deletion_id}");
                    }
                }
                OutputFormat::Json => print_json(&serde_json::json!({ "reverted": deletion_ids }))?,
            }
        }
        Commands::List {
            ids,
            include_deleted,
            kind,
            space,
            limit,
        } => {
            let found = if ids.is_empty() {
                let space = space
                    .as_deref()
                    .map(labtrash_core::model::entity::normalize_code)
                    .transpose()
                    .map_err(|err| CliError::Usage(err.to_string()))?;
                let query = EntityListQuery {
                    kind,
                    space,
                    include_deleted,
                    limit,
                    offset: 0,
                };
                entities.search_entities(&session, &query)?
            } else {
                entities.list_entities(&session, &ids, include_deleted)?
            };
            print_entities(cli.output, &found)?;
        }
        Commands::Deletions {
            id,
            include_reverted,
            limit,
            offset,
        } => {
            let found = match id {
                Some(deletion_id) => vec![deletions.get_deletion(&session, deletion_id)?],
                None => deletions.list_deletions(
                    &session,
                    &DeletionListQuery {
                        include_reverted,
                        limit,
                        offset,
                    },
                )?,
            };
            print_deletions(cli.output, &found)?;
        }
    }
    Ok(())
}

fn start_logging(config: &Config) -> Result<(), CliError> {
    let mut config = config.clone();
    if let Some(dir) = config.log_dir.as_ref().filter(|dir| dir.is_relative()) {
        let cwd = std::env::current_dir()
            .map_err(|err| CliError::Logging(format!("cannot resolve log_dir: {err}")))?;
        config.log_dir = Some(cwd.join(dir));
    }
    init_from_config(&config).map_err(|err| CliError::Logging(err.to_string()))
}

fn build_session(cli: &Cli) -> Session {
    let mut session = Session::new(cli.actor.clone());
    if let Some(role) = cli.instance_role {
        session = session.with_instance_role(role);
    }
    for (space, role) in &cli.space_roles {
        session = session.with_space_role(space, *role);
    }
    if let Some(context) = &cli.context {
        session = session.with_context(context.clone());
    }
    session
}

fn print_entities(output: OutputFormat, entities: &[Entity]) -> Result<(), CliError> {
    match output {
        OutputFormat::Json => print_json(&entities),
        OutputFormat::Text => {
            for entity in entities {
                let state = if entity.is_active() { "active" } else { "deleted" };
                println!(
                    "{}\t{}\t{}\t{state}",
                    entity.perm_id,
                    entity.kind,
                    entity.identifier()
                );
            }
            Ok(())
        }
    }
}

fn print_deletions(output: OutputFormat, deletions: &[DeletionTransaction]) -> Result<(), CliError> {
    match output {
        OutputFormat::Json => print_json(&deletions),
        OutputFormat::Text => {
            for deletion in deletions {
                println!(
                    "{}\t{}\t{}\treverted={}\toriginal={}\tcascaded={}\t{}",
                    deletion.deletion_id,
                    deletion.deleted_at,
                    deletion.actor,
                    deletion.reverted,
                    deletion.original_entities.len(),
                    deletion.cascaded_entities.len(),
                    deletion.reason
                );
                for entry in &deletion.cascaded_entities {
                    println!("  {}\t{}", entry.perm_id, entry.identifier);
                }
            }
            Ok(())
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| CliError::Usage(format!("cannot render JSON: {err}")))?;
    println!("{rendered}");
    Ok(())
}

fn parse_role(value: &str) -> Result<Role, String> {
    value.parse()
}

fn parse_space_role(value: &str) -> Result<(String, Role), String> {
    let (space, role) = value
        .split_once('=')
        .ok_or_else(|| format!("expected SPACE=ROLE, got `{value}`"))?;
    Ok((space.trim().to_string(), role.parse()?))
}

fn parse_kind(value: &str) -> Result<EntityKind, String> {
    EntityKind::parse(&value.trim().to_ascii_lowercase()).ok_or_else(|| {
        format!("unknown entity kind `{value}`; expected space|experiment|sample|dataset|material")
    })
}

fn parse_property(value: &str) -> Result<(String, String), String> {
    let (key, property) = value
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{value}`"))?;
    Ok((key.trim().to_string(), property.to_string()))
}

fn parse_parent(value: &str) -> Result<(EdgeKind, PermId), String> {
    let (kind, id) = value
        .split_once('=')
        .ok_or_else(|| format!("expected EDGE_KIND=PERM_ID, got `{value}`"))?;
    let kind = EdgeKind::parse(kind.trim())
        .ok_or_else(|| format!("unknown edge kind `{kind}`; expected belongs_to|component_of"))?;
    let id = id
        .trim()
        .parse::<PermId>()
        .map_err(|err| format!("invalid perm id `{id}`: {err}"))?;
    Ok((kind, id))
}

#[cfg(test)]
mod tests {
    use super::{parse_kind, parse_parent, parse_space_role, Cli};
    use clap::CommandFactory;
    use labtrash_core::{EdgeKind, EntityKind, Role};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn space_role_flag_parses() {
        assert_eq!(
            parse_space_role("lab=admin").unwrap(),
            ("lab".to_string(), Role::Admin)
        );
        assert!(parse_space_role("lab").is_err());
    }

    #[test]
    fn parent_flag_parses_edge_and_id() {
        let id = uuid::Uuid::new_v4();
        let (kind, parsed) = parse_parent(&format!("component_of={id}")).unwrap();
        assert_eq!(kind, EdgeKind::ComponentOf);
        assert_eq!(parsed, id);
        assert!(parse_parent("owns=abc").is_err());
    }

    #[test]
    fn kind_flag_is_case_insensitive() {
        assert_eq!(parse_kind("DataSet").unwrap(), EntityKind::DataSet);
    }
}
