//! Docker command-line runtime.
//!
//! Drives the `docker` client through `std::process::Command`. Failures to
//! launch the client or reach the daemon are reported as
//! [`RuntimeError::Unavailable`]; everything the daemon refuses is
//! [`RuntimeError::Rejected`], except the "not found" and "removal already in
//! progress" cases which cleanup handles specially.

use super::types::{ContainerHandle, ContainerSpec, NetworkHandle, ResourceFilter, ResourceInfo, ResourceState};
use super::{ContainerRuntime, RuntimeError};
use crate::ip::Subnet;
use log::debug;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::process::Command;

/// Runtime backed by the local `docker` client
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        DockerCli { binary: "docker".to_string() }
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        DockerCli { binary: binary.into() }
    }

    fn run(&self, args: &[String]) -> Result<String, RuntimeError> {
        debug!("{} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| RuntimeError::Unavailable(format!("failed to launch {}: {}", self.binary, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

/// Map the client's error output onto the runtime error taxonomy
pub fn classify_failure(stderr: &str) -> RuntimeError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
        || lower.contains("connection refused")
    {
        RuntimeError::Unavailable(message)
    } else if lower.contains("already in progress") {
        RuntimeError::RemovalInProgress(message)
    } else if lower.contains("no such container") || lower.contains("no such network") || lower.contains("not found") {
        RuntimeError::NotFound(message)
    } else {
        RuntimeError::Rejected(message)
    }
}

/// Quote one word for `sh -c`
fn shell_quote(word: &str) -> String {
    if !word.is_empty() && word.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:=,@".contains(c)) {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn shell_line(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|a| shell_quote(a)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the `docker run` argument list for a container spec
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--network".to_string(),
        spec.network.clone(),
        "--ip".to_string(),
        spec.ip.to_string(),
    ];

    for binding in &spec.port_bindings {
        args.push("-p".to_string());
        args.push(format!("{}:{}/{}", binding.host_port, binding.container_port, binding.protocol.as_str()));
    }
    for mount in &spec.mounts {
        args.push("-v".to_string());
        args.push(format!("{}:{}:ro", mount.host_path.display(), mount.container_path));
    }
    for (key, value) in &spec.environment {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    if spec.init_commands.is_empty() {
        args.push("--entrypoint".to_string());
        args.push(spec.entrypoint.clone());
        args.push(spec.image.clone());
        args.extend(spec.args.iter().cloned());
    } else {
        let steps: Vec<String> = spec
            .init_commands
            .iter()
            .map(|command| shell_line(&spec.entrypoint, command))
            .collect();
        let client = shell_line(&spec.entrypoint, &spec.args);
        let script = match &spec.init_marker {
            Some(marker) => {
                let marker = shell_quote(marker);
                format!(
                    "if [ ! -f {marker} ]; then {} && touch {marker} || exit 1; fi; exec {client}",
                    steps.join(" && ")
                )
            }
            None => format!("{} && exec {client}", steps.join(" && ")),
        };
        args.push("--entrypoint".to_string());
        args.push("sh".to_string());
        args.push(spec.image.clone());
        args.push("-c".to_string());
        args.push(script);
    }
    args
}

fn parse_resource_line(line: &str) -> Option<ResourceInfo> {
    let mut fields = line.split('|');
    let id = fields.next()?.trim();
    let name = fields.next()?.trim().trim_start_matches('/');
    let state = ResourceState::parse(fields.next()?)?;
    let ip = fields.next().and_then(|raw| raw.trim().parse::<Ipv4Addr>().ok());
    if id.is_empty() {
        return None;
    }
    Some(ResourceInfo {
        handle: ContainerHandle(id.to_string()),
        name: name.to_string(),
        state,
        ip,
    })
}

impl ContainerRuntime for DockerCli {
    fn create_virtual_network(
        &self,
        name: &str,
        subnet: &Subnet,
        labels: &BTreeMap<String, String>,
    ) -> Result<NetworkHandle, RuntimeError> {
        let mut args = vec![
            "network".to_string(),
            "create".to_string(),
            "--driver".to_string(),
            "bridge".to_string(),
            "--subnet".to_string(),
            subnet.to_string(),
        ];
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());
        self.run(&args).map(NetworkHandle)
    }

    fn remove_virtual_network(&self, handle: &NetworkHandle) -> Result<(), RuntimeError> {
        self.run(&["network".to_string(), "rm".to_string(), handle.0.clone()]).map(|_| ())
    }

    fn list_virtual_networks(&self) -> Result<Vec<String>, RuntimeError> {
        let output = self.run(&[
            "network".to_string(),
            "ls".to_string(),
            "--format".to_string(),
            "{{.Name}}".to_string(),
        ])?;
        Ok(output.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
    }

    fn create_resource(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        self.run(&run_args(spec)).map(ContainerHandle)
    }

    fn start_resource(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.run(&["start".to_string(), handle.0.clone()]).map(|_| ())
    }

    fn stop_resource(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.run(&["stop".to_string(), handle.0.clone()]).map(|_| ())
    }

    fn remove_resource(&self, handle: &ContainerHandle, force: bool) -> Result<(), RuntimeError> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(handle.0.clone());
        self.run(&args).map(|_| ())
    }

    fn list_resources(&self, filter: &ResourceFilter) -> Result<Vec<ResourceInfo>, RuntimeError> {
        let mut args = vec!["ps".to_string(), "-a".to_string(), "--no-trunc".to_string()];
        for (key, value) in &filter.labels {
            args.push("--filter".to_string());
            args.push(format!("label={}={}", key, value));
        }
        args.push("--format".to_string());
        args.push("{{.ID}}|{{.Names}}|{{.State}}".to_string());

        let output = self.run(&args)?;
        Ok(output.lines().filter_map(parse_resource_line).collect())
    }

    fn inspect_resource(&self, handle: &ContainerHandle) -> Result<ResourceInfo, RuntimeError> {
        let output = self.run(&[
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}|{{.Name}}|{{.State.Status}}|{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}"
                .to_string(),
            handle.0.clone(),
        ])?;
        parse_resource_line(output.lines().next().unwrap_or_default())
            .ok_or_else(|| RuntimeError::Rejected(format!("unexpected inspect output for {}: {}", handle, output)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::types::{Mount, PortBinding, Protocol};
    use std::path::PathBuf;

    fn spec() -> ContainerSpec {
        let mut labels = BTreeMap::new();
        labels.insert("privnet.network".to_string(), "dev".to_string());
        ContainerSpec {
            name: "dev-boot".to_string(),
            image: "ethereum/client-go:v1.13.15".to_string(),
            entrypoint: "geth".to_string(),
            init_commands: vec![],
            init_marker: None,
            args: vec!["--datadir".to_string(), "/data".to_string()],
            environment: BTreeMap::new(),
            port_bindings: vec![PortBinding { host_port: 8545, container_port: 8545, protocol: Protocol::Tcp }],
            mounts: vec![Mount { host_path: PathBuf::from("/tmp/privnet/dev"), container_path: "/config".to_string() }],
            network: "privnet-dev".to_string(),
            ip: Ipv4Addr::new(172, 20, 0, 10),
            labels,
        }
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?"),
            RuntimeError::Unavailable(_)
        ));
        assert!(matches!(
            classify_failure("Error response from daemon: removal of container abc is already in progress"),
            RuntimeError::RemovalInProgress(_)
        ));
        assert!(matches!(classify_failure("Error: No such container: abc"), RuntimeError::NotFound(_)));
        assert!(matches!(
            classify_failure("Error response from daemon: Conflict. The container name \"/dev-boot\" is already in use"),
            RuntimeError::Rejected(_)
        ));
    }

    #[test]
    fn test_run_args_without_init() {
        let args = run_args(&spec());
        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --name dev-boot --network privnet-dev --ip 172.20.0.10"));
        assert!(joined.contains("-p 8545:8545/tcp"));
        assert!(joined.contains("-v /tmp/privnet/dev:/config:ro"));
        assert!(joined.contains("--label privnet.network=dev"));
        assert!(joined.ends_with("--entrypoint geth ethereum/client-go:v1.13.15 --datadir /data"));
    }

    #[test]
    fn test_run_args_with_init_uses_shell() {
        let mut spec = spec();
        spec.init_commands = vec![
            vec!["init".to_string(), "/config/genesis.json".to_string()],
            vec!["account".to_string(), "import".to_string(), "/config/signer/private_key".to_string()],
        ];
        spec.args.push("--http.corsdomain".to_string());
        spec.args.push("*".to_string());

        let args = run_args(&spec);
        assert_eq!(args[args.len() - 2], "-c");
        assert_eq!(
            args[args.len() - 1],
            "geth init /config/genesis.json && geth account import /config/signer/private_key \
             && exec geth --datadir /data --http.corsdomain '*'"
        );
    }

    #[test]
    fn test_init_runs_once_per_data_dir() {
        let mut spec = spec();
        spec.init_commands = vec![
            vec!["init".to_string(), "/config/genesis.json".to_string()],
            vec!["account".to_string(), "import".to_string(), "/config/signer/private_key".to_string()],
        ];
        spec.init_marker = Some("/data/.privnet-initialized".to_string());

        let args = run_args(&spec);
        assert_eq!(
            args[args.len() - 1],
            "if [ ! -f /data/.privnet-initialized ]; then geth init /config/genesis.json \
             && geth account import /config/signer/private_key && touch /data/.privnet-initialized \
             || exit 1; fi; exec geth --datadir /data"
        );
    }

    #[test]
    fn test_parse_resource_line() {
        let info = parse_resource_line("abc123|/dev-boot|running|172.20.0.10").unwrap();
        assert_eq!(info.handle, ContainerHandle("abc123".to_string()));
        assert_eq!(info.name, "dev-boot");
        assert_eq!(info.state, ResourceState::Running);
        assert_eq!(info.ip, Some(Ipv4Addr::new(172, 20, 0, 10)));

        let listed = parse_resource_line("abc123|dev-boot|exited").unwrap();
        assert_eq!(listed.ip, None);
        assert!(parse_resource_line("garbage").is_none());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("eth,net,web3"), "eth,net,web3");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
