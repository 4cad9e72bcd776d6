// ABOUTME: Bootstrap prompt for a coven-ops configuration file.
// ABOUTME: Asks for the state directory and a first service, then writes ops.toml.

use anyhow::{Context, Result};
use coven_ops_core::{parse_command, OpsConfig, ServiceConfig, ServiceKind};
use std::io::{self, BufRead, Write};
use std::path::Path;

fn prompt(input: &mut impl BufRead, message: &str, default: &str) -> Result<String> {
    print!("{} [{}]: ", message, default);
    io::stdout().flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;

    let line = line.trim();
    if line.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(line.to_string())
    }
}

/// Interactive setup against stdin, writing to the default config path
pub fn run_init() -> Result<()> {
    println!("coven-ops initialization\n");
    let path = OpsConfig::default_path();
    if path.exists() {
        anyhow::bail!(
            "Config already exists at {}; edit it directly",
            path.display()
        );
    }

    let stdin = io::stdin();
    let config = build_config(&mut stdin.lock())?;
    config.save(&path)?;
    println!("\nConfig written to {}", path.display());
    println!("\nReady to run: coven-ops run");
    Ok(())
}

fn build_config(input: &mut impl BufRead) -> Result<OpsConfig> {
    let default_state = OpsConfig::default().state_dir_expanded();
    let state_dir = prompt(input, "State directory", &default_state.display().to_string())?;

    let interval = prompt(input, "Health check interval (ms)", "5000")?;
    let health_interval_ms: u64 = interval.parse().context("Invalid interval")?;

    let id = prompt(input, "First service id", "api")?;
    let name = prompt(input, "Display name", &id)?;
    let command = prompt(input, "Command", "npm run dev")?;
    parse_command(&command).context("Invalid command")?;
    let cwd = prompt(input, "Working directory", ".")?;
    let port = prompt(input, "Port (blank for none)", "")?;
    let kind = match prompt(input, "Kind (server/agent)", "server")?.as_str() {
        "agent" => ServiceKind::Agent,
        "server" => ServiceKind::Server,
        other => anyhow::bail!("Unknown kind '{}'", other),
    };

    let mut service = ServiceConfig::new(name, command)
        .with_cwd(Path::new(&cwd))
        .with_kind(kind);
    if !port.is_empty() {
        let port: u16 = port.parse().context("Invalid port")?;
        service = service.with_ports([port]);
    }

    let mut config = OpsConfig {
        state_dir: Some(state_dir),
        health_interval_ms,
        ..OpsConfig::default()
    };
    config.services.insert(id, service);
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_defaults_accepted() {
        let mut input = Cursor::new("\n\n\n\n\n\n\n\n");
        let config = build_config(&mut input).unwrap();
        let api = &config.services["api"];
        assert_eq!(api.name, "api");
        assert_eq!(api.command, "npm run dev");
        assert!(api.ports.is_empty());
        assert_eq!(config.health_interval_ms, 5000);
    }

    #[test]
    fn test_custom_service() {
        let mut input = Cursor::new(
            "/tmp/ops\n1000\nweb\nWeb UI\npython3 -m http.server 8000\n~/site\n8000\nserver\n",
        );
        let config = build_config(&mut input).unwrap();
        assert_eq!(config.state_dir.as_deref(), Some("/tmp/ops"));
        let web = &config.services["web"];
        assert_eq!(web.name, "Web UI");
        assert_eq!(web.ports, vec![8000]);
        assert_eq!(web.kind, ServiceKind::Server);
    }

    #[test]
    fn test_rejects_unterminated_command() {
        let mut input = Cursor::new("\n\napi\n\nrun \"oops\n");
        assert!(build_config(&mut input).is_err());
    }
}
