//! Command handlers for the CLI
//!
//! Operator subcommands work directly on the configured store, so they can
//! run alongside or without a live server.

use fleet_api::FleetConfig;
use fleet_core::{EnvironmentAction, NewQuery, QueryFilter, QueryTarget, TargetType};
use fleet_db::{open_store, CarveService, EnvironmentService, FleetStore, NodeService, QueryService};
use fleet_storage::open_block_store;
use std::sync::Arc;

use crate::{CarveCommands, EnvCommands, NodeCommands, QueryCommands};

pub type CmdResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Operator identity recorded as the creator of CLI queries
const CLI_CREATOR: &str = "cli";

fn open(config: &FleetConfig) -> Result<Arc<dyn FleetStore>, Box<dyn std::error::Error + Send + Sync>> {
    Ok(open_store(&config.database.url)?)
}

/// Parse a `type:value` target; a bare value targets a node uuid
pub fn parse_target(raw: &str) -> Result<QueryTarget, String> {
    let (kind, value) = match raw.split_once(':') {
        Some((kind, value)) => {
            let kind = TargetType::parse(kind.trim()).ok_or_else(|| format!("unknown target type '{}'", kind))?;
            (kind, value.trim())
        }
        None => (TargetType::Uuid, raw.trim()),
    };
    if value.is_empty() {
        return Err(format!("target '{}' has no value", raw));
    }
    Ok(QueryTarget::new(kind, value))
}

fn parse_targets(raw: &[String]) -> Result<Vec<QueryTarget>, String> {
    raw.iter().map(|t| parse_target(t)).collect()
}

fn env_action(action: &EnvCommands) -> Option<(&str, EnvironmentAction)> {
    let pair = match action {
        EnvCommands::RotateSecret { env } => (env, EnvironmentAction::RotateSecret),
        EnvCommands::RotateEnroll { env } => (env, EnvironmentAction::RotateEnroll),
        EnvCommands::ExpireEnroll { env } => (env, EnvironmentAction::ExpireEnroll),
        EnvCommands::RotateRemove { env } => (env, EnvironmentAction::RotateRemove),
        EnvCommands::ExpireRemove { env } => (env, EnvironmentAction::ExpireRemove),
        EnvCommands::AcceptEnrolls { env } => (env, EnvironmentAction::AcceptEnrolls),
        EnvCommands::RejectEnrolls { env } => (env, EnvironmentAction::RejectEnrolls),
        _ => return None,
    };
    Some((pair.0.as_str(), pair.1))
}

/// Handle environment commands
pub async fn handle_env_command(action: EnvCommands, config: &FleetConfig) -> CmdResult {
    let environments = EnvironmentService::new(open(config)?);

    if let Some((env, kind)) = env_action(&action) {
        let updated = environments.apply_action(env, kind).await?;
        println!("Environment {} updated ({:?})", updated.name, kind);
        println!("  Accept enrolls: {}", updated.accept_enrolls);
        println!("  Enroll path expires: {}", updated.enroll_expire);
        println!("  Remove path expires: {}", updated.remove_expire);
        return Ok(());
    }

    match action {
        EnvCommands::Create { name, hostname } => {
            let env = environments.create(&name, &hostname).await?;
            println!("Environment created successfully!");
            println!("  Name: {}", env.name);
            println!("  UUID: {}", env.uuid);
            println!("  Hostname: {}", env.hostname);
            println!("  Enroll secret: {}", env.secret);
        }

        EnvCommands::List => {
            let envs = environments.list().await?;
            println!("Found {} environments:", envs.len());
            for env in envs {
                println!(
                    "  {} ({}) host={} enrolls={}",
                    env.name, env.uuid, env.hostname, env.accept_enrolls
                );
            }
        }

        EnvCommands::Show { env } => {
            let env = environments.get(&env).await?;
            println!("{}", serde_json::to_string_pretty(&env)?);
        }

        _ => {}
    }

    Ok(())
}

/// Handle node commands
pub async fn handle_node_command(action: NodeCommands, config: &FleetConfig) -> CmdResult {
    let store = open(config)?;
    let environments = EnvironmentService::new(store.clone());
    let nodes = NodeService::new(store);

    match action {
        NodeCommands::List { env } => {
            let env = environments.get(&env).await?;
            let list = nodes.list(&env.uuid).await?;
            println!("Found {} nodes:", list.len());
            for node in list {
                let seen = node
                    .last_seen()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "  {} {} platform={} version={} last_seen={}",
                    node.uuid, node.hostname, node.platform, node.osquery_version, seen
                );
            }
        }

        NodeCommands::Show { env, uuid } => {
            let env = environments.get(&env).await?;
            let mut node = nodes.get(&env.uuid, &uuid).await?;
            node.node_key.clear();
            println!("{}", serde_json::to_string_pretty(&node)?);

            let archived = nodes.archived(&env.uuid, &uuid).await?;
            if !archived.is_empty() {
                println!("Archived records:");
                for entry in archived {
                    println!("  {} ({})", entry.archived_at, entry.trigger.as_str());
                }
            }
        }

        NodeCommands::Remove { env, uuid } => {
            let env = environments.get(&env).await?;
            let node = nodes.remove(&env.uuid, &uuid).await?;
            println!("Node {} removed from {}", node.uuid, env.name);
        }
    }

    Ok(())
}

/// Handle query commands
pub async fn handle_query_command(action: QueryCommands, config: &FleetConfig) -> CmdResult {
    let store = open(config)?;
    let environments = EnvironmentService::new(store.clone());
    let queries = QueryService::new(store);

    match action {
        QueryCommands::Create {
            env,
            query,
            name,
            targets,
            hidden,
            protected,
        } => {
            let env = environments.get(&env).await?;
            let mut new = NewQuery::standard(query, parse_targets(&targets)?).with_creator(CLI_CREATOR);
            new.name = name;
            new.hidden = hidden;
            new.protected = protected;

            let created = queries.create(&env, new).await?;
            println!("Query created successfully!");
            println!("  Name: {}", created.name);
            println!("  Expected nodes: {}", created.expected);
        }

        QueryCommands::List {
            env,
            status,
            include_hidden,
        } => {
            let env = environments.get(&env).await?;
            let filter = QueryFilter::parse(&status).ok_or_else(|| format!("unknown status filter '{}'", status))?;
            let list = queries.list(&env.uuid, filter, include_hidden).await?;
            println!("Found {} queries:", list.len());
            for q in list {
                println!(
                    "  {} [{}] {}/{} errors={} active={} completed={}",
                    q.name,
                    q.query_type.as_str(),
                    q.executions,
                    q.expected,
                    q.errors,
                    q.active,
                    q.completed
                );
            }
        }

        QueryCommands::Complete { env, name } => {
            let env = environments.get(&env).await?;
            let q = queries.complete(&env.uuid, &name).await?;
            println!("Query {} completed", q.name);
        }

        QueryCommands::Activate { env, name } => {
            let env = environments.get(&env).await?;
            let q = queries.activate(&env.uuid, &name).await?;
            println!("Query {} activated", q.name);
        }

        QueryCommands::Delete { env, name } => {
            let env = environments.get(&env).await?;
            let q = queries.delete(&env.uuid, &name).await?;
            println!("Query {} deleted", q.name);
        }
    }

    Ok(())
}

/// Handle carve commands
pub async fn handle_carve_command(action: CarveCommands, config: &FleetConfig) -> CmdResult {
    let store = open(config)?;
    let environments = EnvironmentService::new(store.clone());

    match action {
        CarveCommands::Create { env, path, targets } => {
            let env = environments.get(&env).await?;
            let queries = QueryService::new(store);
            let created = queries
                .create_carve(&env, &path, parse_targets(&targets)?, CLI_CREATOR)
                .await?;
            println!("Carve query created successfully!");
            println!("  Name: {}", created.name);
            println!("  Expected nodes: {}", created.expected);
        }

        CarveCommands::List { env } => {
            let env = environments.get(&env).await?;
            let carves = CarveService::new(store, open_block_store(&config.carver).await?);
            let list = carves.list(&env.uuid).await?;
            println!("Found {} carves:", list.len());
            for carve in list {
                println!(
                    "  {} node={} path={} {}/{} blocks status={}",
                    carve.session_id,
                    carve.node_uuid,
                    carve.path,
                    carve.completed_blocks,
                    carve.block_count,
                    carve.status
                );
            }
        }

        CarveCommands::Archive { env, session } => {
            let env = environments.get(&env).await?;
            let carves = CarveService::new(store, open_block_store(&config.carver).await?);
            let carve = carves.archive(&env.uuid, &session).await?;
            println!("Carve {} archived", carve.session_id);
            if let Some(location) = carve.archive {
                println!("  Archive: {}", location.file_name());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sqlite_config(dir: &TempDir) -> FleetConfig {
        let mut config = FleetConfig::default();
        config.database.url = format!("sqlite:{}", dir.path().join("fleet.db").display());
        config.carver.path = dir.path().join("carves");
        config
    }

    #[test]
    fn test_parse_target() {
        let target = parse_target("platform:darwin").unwrap();
        assert_eq!(target.target_type, TargetType::Platform);
        assert_eq!(target.value, "darwin");

        let bare = parse_target("abc-123").unwrap();
        assert_eq!(bare.target_type, TargetType::Uuid);
        assert_eq!(bare.value, "ABC-123");

        assert!(parse_target("galaxy:far").is_err());
        assert!(parse_target("uuid:").is_err());
    }

    #[tokio::test]
    async fn test_env_and_query_commands_share_the_store() {
        let dir = TempDir::new().unwrap();
        let config = sqlite_config(&dir);

        handle_env_command(
            EnvCommands::Create {
                name: "acme".into(),
                hostname: "fleet.test".into(),
            },
            &config,
        )
        .await
        .unwrap();
        handle_env_command(EnvCommands::RejectEnrolls { env: "acme".into() }, &config)
            .await
            .unwrap();
        handle_query_command(
            QueryCommands::Create {
                env: "acme".into(),
                query: "SELECT 1".into(),
                name: Some("q1".into()),
                targets: vec!["environment:acme".into()],
                hidden: false,
                protected: true,
            },
            &config,
        )
        .await
        .unwrap();

        // Protected queries refuse deletion
        let deleted = handle_query_command(
            QueryCommands::Delete {
                env: "acme".into(),
                name: "q1".into(),
            },
            &config,
        )
        .await;
        assert!(deleted.is_err());

        let store = open(&config).unwrap();
        let env = EnvironmentService::new(store.clone()).get("acme").await.unwrap();
        assert!(!env.accept_enrolls);
        let query = QueryService::new(store).get(&env.uuid, "q1").await.unwrap();
        assert_eq!(query.creator, CLI_CREATOR);
        assert!(query.active);
    }

    #[tokio::test]
    async fn test_unknown_environment_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config = sqlite_config(&dir);

        let result = handle_node_command(NodeCommands::List { env: "missing".into() }, &config).await;
        assert!(result.is_err());
    }
}
