#[cfg(test)]
mod orchestrator_tests {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::{Arc, Mutex, Weak};
    use tempfile::TempDir;

    use privnet::config::{NetworkConfig, NodeSpec, Role};
    use privnet::conflict::Conflict;
    use privnet::genesis::GenesisDocument;
    use privnet::ip::Subnet;
    use privnet::config::ValidationError;
    use privnet::process::INIT_MARKER_FILE;
    use privnet::registry::{JsonFileStore, MemoryStore, NetworkInfo, NetworkStatus, NodeStatus};
    use privnet::runtime::{
        ContainerHandle, ContainerRuntime, ContainerSpec, NetworkHandle, ResourceFilter, ResourceInfo,
        ResourceState, RuntimeError, LABEL_NETWORK,
    };
    use privnet::settings::{OrchestratorSettings, RetryPolicy};
    use privnet::{NetworkOrchestrator, OrchestratorError};

    /// How the fake runtime misbehaves on one container creation
    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Failure {
        /// The runtime refuses the request
        Reject,
        /// The container is created but exits straight away
        Exit,
    }

    #[derive(Debug, Clone)]
    struct FakeContainer {
        name: String,
        spec: ContainerSpec,
        state: ResourceState,
    }

    #[derive(Debug, Default)]
    struct FakeState {
        networks: BTreeMap<String, (String, BTreeMap<String, String>)>,
        containers: BTreeMap<String, FakeContainer>,
        creates: usize,
        next_id: usize,
        fail_at: Option<(usize, Failure)>,
    }

    /// Called with every container spec before it is created
    type CreateHook = Box<dyn FnMut(&ContainerSpec) + Send>;

    /// In-memory container runtime recording every resource it holds
    #[derive(Default)]
    struct FakeRuntime {
        state: Mutex<FakeState>,
        on_create: Mutex<Option<CreateHook>>,
    }

    impl FakeRuntime {
        fn on_create(&self, hook: impl FnMut(&ContainerSpec) + Send + 'static) {
            *self.on_create.lock().unwrap() = Some(Box::new(hook));
        }

        /// Misbehave on the `nth` container creation counted from now
        fn fail_next(&self, nth: usize, failure: Failure) {
            let mut state = self.state.lock().unwrap();
            state.fail_at = Some((state.creates + nth, failure));
        }

        fn container_count(&self) -> usize {
            self.state.lock().unwrap().containers.len()
        }

        fn network_count(&self) -> usize {
            self.state.lock().unwrap().networks.len()
        }

        fn labelled(&self, network_id: &str) -> usize {
            let filter = ResourceFilter::network(network_id);
            self.list_resources(&filter).unwrap().len()
        }

        fn spec_named(&self, name: &str) -> Option<ContainerSpec> {
            let state = self.state.lock().unwrap();
            state.containers.values().find(|c| c.name == name).map(|c| c.spec.clone())
        }

        fn add_foreign_network(&self, name: &str) {
            let mut state = self.state.lock().unwrap();
            state.networks.insert(format!("foreign-{}", name), (name.to_string(), BTreeMap::new()));
        }
    }

    impl ContainerRuntime for FakeRuntime {
        fn create_virtual_network(
            &self,
            name: &str,
            _subnet: &Subnet,
            labels: &BTreeMap<String, String>,
        ) -> Result<NetworkHandle, RuntimeError> {
            let mut state = self.state.lock().unwrap();
            if state.networks.values().any(|(existing, _)| existing == name) {
                return Err(RuntimeError::Rejected(format!("network with name {} already exists", name)));
            }
            state.next_id += 1;
            let handle = format!("net{}", state.next_id);
            state.networks.insert(handle.clone(), (name.to_string(), labels.clone()));
            Ok(NetworkHandle(handle))
        }

        fn remove_virtual_network(&self, handle: &NetworkHandle) -> Result<(), RuntimeError> {
            let mut state = self.state.lock().unwrap();
            // Like docker, a network can be addressed by name as well
            let key = state
                .networks
                .iter()
                .find(|(id, (name, _))| **id == handle.0 || *name == handle.0)
                .map(|(id, _)| id.clone());
            match key.and_then(|key| state.networks.remove(&key)) {
                Some(_) => Ok(()),
                None => Err(RuntimeError::NotFound(handle.0.clone())),
            }
        }

        fn list_virtual_networks(&self) -> Result<Vec<String>, RuntimeError> {
            let state = self.state.lock().unwrap();
            Ok(state.networks.values().map(|(name, _)| name.clone()).collect())
        }

        fn create_resource(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
            let hook = self.on_create.lock().unwrap().take();
            if let Some(mut hook) = hook {
                hook(spec);
                *self.on_create.lock().unwrap() = Some(hook);
            }

            let mut state = self.state.lock().unwrap();
            state.creates += 1;
            let failure = match state.fail_at {
                Some((at, failure)) if at == state.creates => Some(failure),
                _ => None,
            };
            if failure == Some(Failure::Reject) {
                return Err(RuntimeError::Rejected("port is already allocated".to_string()));
            }
            if state.containers.values().any(|c| c.name == spec.name) {
                return Err(RuntimeError::Rejected(format!("name {} is already in use", spec.name)));
            }

            state.next_id += 1;
            let handle = format!("c{}", state.next_id);
            let container = FakeContainer {
                name: spec.name.clone(),
                spec: spec.clone(),
                state: if failure == Some(Failure::Exit) { ResourceState::Exited } else { ResourceState::Running },
            };
            state.containers.insert(handle.clone(), container);
            Ok(ContainerHandle(handle))
        }

        fn start_resource(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
            let mut state = self.state.lock().unwrap();
            let container = state.containers.get_mut(&handle.0).ok_or_else(|| RuntimeError::NotFound(handle.0.clone()))?;
            container.state = ResourceState::Running;
            Ok(())
        }

        fn stop_resource(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
            let mut state = self.state.lock().unwrap();
            let container = state.containers.get_mut(&handle.0).ok_or_else(|| RuntimeError::NotFound(handle.0.clone()))?;
            container.state = ResourceState::Exited;
            Ok(())
        }

        fn remove_resource(&self, handle: &ContainerHandle, _force: bool) -> Result<(), RuntimeError> {
            let mut state = self.state.lock().unwrap();
            match state.containers.remove(&handle.0) {
                Some(_) => Ok(()),
                None => Err(RuntimeError::NotFound(handle.0.clone())),
            }
        }

        fn list_resources(&self, filter: &ResourceFilter) -> Result<Vec<ResourceInfo>, RuntimeError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .containers
                .iter()
                .filter(|(_, c)| filter.matches(&c.spec.labels))
                .map(|(handle, c)| ResourceInfo {
                    handle: ContainerHandle(handle.clone()),
                    name: c.name.clone(),
                    state: c.state,
                    ip: Some(c.spec.ip),
                })
                .collect())
        }

        fn inspect_resource(&self, handle: &ContainerHandle) -> Result<ResourceInfo, RuntimeError> {
            let state = self.state.lock().unwrap();
            let container = state.containers.get(&handle.0).ok_or_else(|| RuntimeError::NotFound(handle.0.clone()))?;
            Ok(ResourceInfo {
                handle: handle.clone(),
                name: container.name.clone(),
                state: container.state,
                ip: Some(container.spec.ip),
            })
        }
    }

    fn dev_config() -> NetworkConfig {
        NetworkConfig {
            network_id: "dev".to_string(),
            chain_id: 1337,
            subnet: "172.20.0.0/24".to_string(),
            nodes: vec![
                NodeSpec::new("boot", Role::Bootnode),
                NodeSpec::new("signer-1", Role::Validator),
                NodeSpec::new("signer-2", Role::Validator),
                NodeSpec::new("rpc", Role::Rpc),
            ],
            base_rpc_port: None,
            base_p2p_port: None,
        }
    }

    fn settings(dir: &TempDir) -> OrchestratorSettings {
        OrchestratorSettings {
            work_dir: dir.path().to_path_buf(),
            retry: RetryPolicy::immediate(2),
            ..OrchestratorSettings::default()
        }
    }

    fn setup() -> (TempDir, Arc<FakeRuntime>, NetworkOrchestrator) {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let orchestrator = NetworkOrchestrator::new(settings(&dir), runtime.clone(), Arc::new(MemoryStore::new()));
        (dir, runtime, orchestrator)
    }

    fn flag<'a>(spec: &'a ContainerSpec, name: &str) -> Option<&'a str> {
        let index = spec.args.iter().position(|a| a == name)?;
        spec.args.get(index + 1).map(String::as_str)
    }

    #[test]
    fn test_create_network_provisions_every_node() {
        let (dir, runtime, orchestrator) = setup();

        let network = orchestrator.create_network(&dev_config()).unwrap();

        assert_eq!(network.status, NetworkStatus::Running);
        assert_eq!(network.nodes.len(), 4);
        assert!(network.nodes.values().all(|n| n.status == NodeStatus::Running));
        assert_eq!(runtime.container_count(), 4);
        assert_eq!(runtime.network_count(), 1);
        assert_eq!(runtime.labelled("dev"), 4);

        // Genesis on disk lists exactly the validators as signers
        let genesis = GenesisDocument::read_from(&dir.path().join("dev").join("genesis.json")).unwrap();
        let mut signers = genesis.signers().unwrap();
        signers.sort();
        let mut expected: Vec<String> = ["signer-1", "signer-2"]
            .iter()
            .map(|id| network.nodes[*id].credentials.address.clone())
            .collect();
        expected.sort();
        assert_eq!(signers, expected);
        assert_eq!(genesis.chain_id(), 1337);

        // Every dependent node points at the bootstrap node
        let bootstrap = network.bootstrap_url().unwrap().to_string();
        assert!(bootstrap.ends_with("@172.20.0.10:30303"));
        let boot = runtime.spec_named("dev-boot").unwrap();
        assert!(flag(&boot, "--bootnodes").is_none());
        for name in ["dev-signer-1", "dev-signer-2", "dev-rpc"] {
            let spec = runtime.spec_named(name).unwrap();
            assert_eq!(flag(&spec, "--bootnodes"), Some(bootstrap.as_str()));
        }

        assert_eq!(orchestrator.get_network("dev").unwrap(), network);
    }

    #[test]
    fn test_failed_container_rolls_back_everything() {
        let (dir, runtime, orchestrator) = setup();
        runtime.fail_next(2, Failure::Reject);

        let err = orchestrator.create_network(&dev_config()).unwrap_err();

        match &err {
            OrchestratorError::PartialProvisionFailure { network_id, stage, provisioned, cause, rollback_failures } => {
                assert_eq!(network_id, "dev");
                assert_eq!(stage, "node signer-1");
                assert_eq!(*provisioned, 1);
                assert!(matches!(**cause, OrchestratorError::RuntimeRejected(_)));
                assert!(rollback_failures.is_empty());
            }
            other => panic!("unexpected error {:?}", other),
        }

        assert!(orchestrator.list_networks().unwrap().is_empty());
        assert_eq!(runtime.container_count(), 0);
        assert_eq!(runtime.network_count(), 0);
        assert_eq!(runtime.labelled("dev"), 0);
        assert!(!dir.path().join("dev").exists());
    }

    #[test]
    fn test_container_that_never_runs_is_removed() {
        let (_dir, runtime, orchestrator) = setup();
        runtime.fail_next(1, Failure::Exit);

        let err = orchestrator.create_network(&dev_config()).unwrap_err();

        assert!(matches!(err, OrchestratorError::PartialProvisionFailure { provisioned: 0, .. }));
        assert_eq!(runtime.container_count(), 0);
        assert_eq!(runtime.network_count(), 0);

        // The same description succeeds once the runtime behaves
        assert!(orchestrator.create_network(&dev_config()).is_ok());
    }

    #[test]
    fn test_resubmission_reports_exactly_one_name_conflict() {
        let (_dir, runtime, orchestrator) = setup();
        let network = orchestrator.create_network(&dev_config()).unwrap();

        let err = orchestrator.create_network(&dev_config()).unwrap_err();

        let conflicts = err.conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(matches!(&conflicts.as_slice()[0], Conflict::Name { network_id, .. } if network_id == "dev"));
        assert_eq!(runtime.container_count(), 4);
        assert_eq!(runtime.network_count(), 1);
        assert_eq!(orchestrator.get_network("dev").unwrap(), network);
    }

    #[test]
    fn test_clashing_network_reports_every_conflict() {
        let (_dir, runtime, orchestrator) = setup();
        orchestrator.create_network(&dev_config()).unwrap();

        let mut clashing = dev_config();
        clashing.network_id = "qa".to_string();
        clashing.subnet = "172.20.0.128/25".to_string();
        clashing.nodes[0].rpc_port = Some(8545);

        let err = orchestrator.create_network(&clashing).unwrap_err();
        let conflicts = err.conflicts().unwrap();
        assert_eq!(conflicts.len(), 3);
        assert!(conflicts.iter().any(|c| matches!(c, Conflict::ChainId { chain_id: 1337, .. })));
        assert!(conflicts.iter().any(|c| matches!(c, Conflict::SubnetOverlap { .. })));
        assert!(conflicts.iter().any(|c| matches!(c, Conflict::Port { port: 8545, .. })));
        assert_eq!(runtime.container_count(), 4);
        assert_eq!(orchestrator.list_networks().unwrap().len(), 1);
    }

    #[test]
    fn test_parallel_network_gets_free_ports() {
        let (_dir, runtime, orchestrator) = setup();
        orchestrator.create_network(&dev_config()).unwrap();

        let mut second = dev_config();
        second.network_id = "qa".to_string();
        second.chain_id = 2024;
        second.subnet = "172.21.0.0/24".to_string();
        let qa = orchestrator.create_network(&second).unwrap();

        let boot = qa.config.node("boot").unwrap();
        assert_eq!(boot.rpc_port, 8549);
        assert_eq!(boot.p2p_port, 30307);
        assert_eq!(runtime.container_count(), 8);
        assert_eq!(runtime.network_count(), 2);
    }

    #[test]
    fn test_existing_runtime_network_is_a_conflict() {
        let (_dir, runtime, orchestrator) = setup();
        runtime.add_foreign_network("privnet-dev");

        let err = orchestrator.create_network(&dev_config()).unwrap_err();

        let conflicts = err.conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(matches!(&conflicts.as_slice()[0], Conflict::RuntimeNetwork { name } if name == "privnet-dev"));
        assert!(orchestrator.list_networks().unwrap().is_empty());
    }

    #[test]
    fn test_plan_touches_nothing() {
        let (dir, runtime, orchestrator) = setup();
        let output = dir.path().join("plan");

        let plan = orchestrator.plan_network(&dev_config()).unwrap();
        plan.write_to(&output, "/config").unwrap();

        assert_eq!(plan.containers.len(), 4);
        assert_eq!(plan.containers[0].name, "dev-boot");
        assert!(output.join("dev").join("genesis.json").exists());
        assert!(output.join("dev").join("containers.json").exists());
        assert!(output.join("dev").join("signer-1").join("password").exists());
        assert_eq!(runtime.container_count(), 0);
        assert!(orchestrator.list_networks().unwrap().is_empty());
    }

    #[test]
    fn test_add_node_joins_running_network() {
        let (_dir, runtime, orchestrator) = setup();
        let network = orchestrator.create_network(&dev_config()).unwrap();

        let node = orchestrator.add_node("dev", NodeSpec::new("rpc-2", Role::Rpc)).unwrap();

        assert_eq!(node.status, NodeStatus::Running);
        assert_eq!(node.ip.to_string(), "172.20.0.14");
        let updated = orchestrator.get_network("dev").unwrap();
        assert_eq!(updated.nodes.len(), 5);
        let resolved = updated.config.node("rpc-2").unwrap();
        assert_eq!(resolved.rpc_port, 8549);
        assert_eq!(resolved.p2p_port, 30307);

        let spec = runtime.spec_named("dev-rpc-2").unwrap();
        assert_eq!(flag(&spec, "--bootnodes"), network.bootstrap_url());
        assert_eq!(runtime.container_count(), 5);
    }

    #[test]
    fn test_add_node_with_duplicate_id_changes_nothing() {
        let (_dir, runtime, orchestrator) = setup();
        let network = orchestrator.create_network(&dev_config()).unwrap();

        let err = orchestrator.add_node("dev", NodeSpec::new("rpc", Role::Plain)).unwrap_err();

        let conflicts = err.conflicts().unwrap();
        assert!(matches!(&conflicts.as_slice()[0], Conflict::NodeId { node_id, .. } if node_id == "rpc"));
        assert_eq!(orchestrator.get_network("dev").unwrap(), network);
        assert_eq!(runtime.container_count(), 4);
    }

    #[test]
    fn test_add_node_with_taken_port_is_rejected() {
        let (_dir, _runtime, orchestrator) = setup();
        orchestrator.create_network(&dev_config()).unwrap();

        let mut node = NodeSpec::new("rpc-2", Role::Rpc);
        node.rpc_port = Some(8546);
        let err = orchestrator.add_node("dev", node).unwrap_err();

        let conflicts = err.conflicts().unwrap();
        assert!(matches!(
            &conflicts.as_slice()[0],
            Conflict::Port { port: 8546, suggestion: Some(8549), .. }
        ));
    }

    #[test]
    fn test_failed_add_node_leaves_network_untouched() {
        let (dir, runtime, orchestrator) = setup();
        let network = orchestrator.create_network(&dev_config()).unwrap();
        runtime.fail_next(1, Failure::Exit);

        let err = orchestrator.add_node("dev", NodeSpec::new("signer-3", Role::Validator)).unwrap_err();

        assert!(matches!(err, OrchestratorError::PartialProvisionFailure { ref stage, .. } if stage == "node signer-3"));
        assert_eq!(orchestrator.get_network("dev").unwrap(), network);
        assert_eq!(runtime.container_count(), 4);
        assert!(!dir.path().join("dev").join("signer-3").exists());
        assert!(dir.path().join("dev").join("genesis.json").exists());
    }

    #[test]
    fn test_add_node_requires_running_network() {
        let (_dir, _runtime, orchestrator) = setup();
        orchestrator.create_network(&dev_config()).unwrap();
        orchestrator.stop_network("dev").unwrap();

        let err = orchestrator.add_node("dev", NodeSpec::new("rpc-2", Role::Rpc)).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { status: NetworkStatus::Stopped, .. }));

        let err = orchestrator.add_node("nope", NodeSpec::new("rpc-2", Role::Rpc)).unwrap_err();
        assert!(matches!(err, OrchestratorError::NetworkNotFound(id) if id == "nope"));
    }

    #[test]
    fn test_add_node_rejects_port_shape_errors() {
        let (_dir, runtime, orchestrator) = setup();
        let network = orchestrator.create_network(&dev_config()).unwrap();

        let mut node = NodeSpec::new("rpc-2", Role::Rpc);
        node.rpc_port = Some(9100);
        node.p2p_port = Some(9100);
        let err = orchestrator.add_node("dev", node).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Validation(ValidationError::InvalidNode(ref m)) if m.contains("same port")
        ));

        let mut node = NodeSpec::new("rpc-2", Role::Rpc);
        node.p2p_port = Some(0);
        let err = orchestrator.add_node("dev", node).unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(ValidationError::InvalidNode(_))));

        assert_eq!(orchestrator.get_network("dev").unwrap(), network);
        assert_eq!(runtime.container_count(), 4);
    }

    #[test]
    fn test_joining_node_ports_are_held_while_it_launches() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::default());
        let orchestrator = NetworkOrchestrator::new(settings(&dir), runtime.clone(), store.clone());
        orchestrator.create_network(&dev_config()).unwrap();

        // Another orchestrator on the same registry creates `qa` while rpc-2's container is being created
        let other_dir = TempDir::new().unwrap();
        let other_settings = settings(&other_dir);
        let other_store = store.clone();
        let created: Arc<Mutex<Option<NetworkInfo>>> = Arc::new(Mutex::new(None));
        let slot = created.clone();
        runtime.on_create(move |spec| {
            if spec.name != "dev-rpc-2" {
                return;
            }
            let other = NetworkOrchestrator::new(
                other_settings.clone(),
                Arc::new(FakeRuntime::default()),
                other_store.clone(),
            );
            let mut qa = dev_config();
            qa.network_id = "qa".to_string();
            qa.chain_id = 1338;
            qa.subnet = "172.21.0.0/24".to_string();
            *slot.lock().unwrap() = Some(other.create_network(&qa).unwrap());
        });

        let node = orchestrator.add_node("dev", NodeSpec::new("rpc-2", Role::Rpc)).unwrap();

        let qa = created.lock().unwrap().take().unwrap();
        let dev = orchestrator.get_network("dev").unwrap();
        assert!(dev.nodes.contains_key(&node.id));
        let dev_ports: HashSet<u16> = dev.config.bound_ports().into_iter().map(|(port, _)| port).collect();
        assert_eq!(dev_ports.len(), 10);
        for (port, owner) in qa.config.bound_ports() {
            assert!(!dev_ports.contains(&port), "qa/{} reuses port {}", owner, port);
        }
    }

    #[test]
    fn test_operations_on_a_busy_network_are_refused() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let orchestrator = Arc::new(NetworkOrchestrator::new(
            settings(&dir),
            runtime.clone(),
            Arc::new(MemoryStore::new()),
        ));
        orchestrator.create_network(&dev_config()).unwrap();

        let refused: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let handle: Weak<NetworkOrchestrator> = Arc::downgrade(&orchestrator);
            let refused = refused.clone();
            runtime.on_create(move |spec| {
                let Some(orchestrator) = handle.upgrade() else { return };
                let network_id = spec.labels.get(LABEL_NETWORK).cloned().unwrap_or_default();
                for err in [
                    orchestrator.stop_network(&network_id).unwrap_err(),
                    orchestrator.destroy_network(&network_id).unwrap_err(),
                ] {
                    if let OrchestratorError::Busy(id) = err {
                        refused.lock().unwrap().push(id);
                    }
                }
                assert!(orchestrator.get_network(&network_id).is_ok());
            });
        }

        orchestrator.add_node("dev", NodeSpec::new("rpc-2", Role::Rpc)).unwrap();
        assert_eq!(*refused.lock().unwrap(), vec!["dev".to_string(), "dev".to_string()]);

        // Once the operation is over the claim is released
        orchestrator.stop_network("dev").unwrap();
    }

    #[test]
    fn test_interrupted_creation_can_be_destroyed() {
        let (_dir, runtime, orchestrator) = setup();
        let plan = orchestrator.plan_network(&dev_config()).unwrap();

        // What a crash after the reservation and the network attach leaves behind
        orchestrator.registry().put(&NetworkInfo::reservation(plan.config.clone())).unwrap();
        runtime
            .create_virtual_network(&plan.config.runtime_network_name, &plan.config.subnet, &BTreeMap::new())
            .unwrap();
        let err = orchestrator.create_network(&dev_config()).unwrap_err();
        assert!(err.conflicts().is_some());

        orchestrator.destroy_network("dev").unwrap();

        assert!(orchestrator.list_networks().unwrap().is_empty());
        assert_eq!(runtime.network_count(), 0);
        let network = orchestrator.create_network(&dev_config()).unwrap();
        assert_eq!(network.status, NetworkStatus::Running);
    }

    #[test]
    fn test_last_bootnode_cannot_be_removed() {
        let (_dir, runtime, orchestrator) = setup();
        let network = orchestrator.create_network(&dev_config()).unwrap();

        let err = orchestrator.remove_node("dev", "boot").unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(ValidationError::MissingBootnode)));
        assert_eq!(orchestrator.get_network("dev").unwrap(), network);
        assert_eq!(runtime.container_count(), 4);

        // With a second bootnode either one may go
        orchestrator.add_node("dev", NodeSpec::new("boot-2", Role::Bootnode)).unwrap();
        orchestrator.remove_node("dev", "boot-2").unwrap();
        orchestrator.add_node("dev", NodeSpec::new("boot-3", Role::Bootnode)).unwrap();
        orchestrator.remove_node("dev", "boot").unwrap();
        assert!(matches!(
            orchestrator.remove_node("dev", "boot-3").unwrap_err(),
            OrchestratorError::Validation(ValidationError::MissingBootnode)
        ));
    }

    #[test]
    fn test_remove_node() {
        let (dir, runtime, orchestrator) = setup();
        orchestrator.create_network(&dev_config()).unwrap();

        orchestrator.remove_node("dev", "rpc").unwrap();

        let network = orchestrator.get_network("dev").unwrap();
        assert!(!network.nodes.contains_key("rpc"));
        assert!(network.config.node("rpc").is_none());
        assert_eq!(runtime.container_count(), 3);
        assert!(runtime.spec_named("dev-rpc").is_none());
        assert!(!dir.path().join("dev").join("rpc").exists());

        let err = orchestrator.remove_node("dev", "rpc").unwrap_err();
        assert!(matches!(err, OrchestratorError::NodeNotFound { .. }));
    }

    #[test]
    fn test_stop_and_start() {
        let (_dir, runtime, orchestrator) = setup();
        orchestrator.create_network(&dev_config()).unwrap();

        // Validators are restarted with their keystore already populated
        let signer = runtime.spec_named("dev-signer-1").unwrap();
        assert!(signer.init_marker.as_deref().is_some_and(|m| m.ends_with(INIT_MARKER_FILE)));

        let stopped = orchestrator.stop_network("dev").unwrap();
        assert_eq!(stopped.status, NetworkStatus::Stopped);
        assert!(stopped.nodes.values().all(|n| n.status == NodeStatus::Stopped));
        assert_eq!(runtime.container_count(), 4);

        let err = orchestrator.stop_network("dev").unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { .. }));

        let running = orchestrator.start_network("dev").unwrap();
        assert_eq!(running.status, NetworkStatus::Running);
        assert!(running.nodes.values().all(|n| n.status == NodeStatus::Running));
    }

    #[test]
    fn test_destroy_releases_everything() {
        let (dir, runtime, orchestrator) = setup();
        orchestrator.create_network(&dev_config()).unwrap();

        orchestrator.destroy_network("dev").unwrap();

        assert!(orchestrator.list_networks().unwrap().is_empty());
        assert_eq!(runtime.container_count(), 0);
        assert_eq!(runtime.network_count(), 0);
        assert!(!dir.path().join("dev").exists());
        assert!(matches!(
            orchestrator.destroy_network("dev").unwrap_err(),
            OrchestratorError::NetworkNotFound(_)
        ));

        // Name, chain id, subnet and ports are free again
        orchestrator.create_network(&dev_config()).unwrap();
    }

    #[test]
    fn test_destroy_sweeps_untracked_labelled_containers() {
        let (_dir, runtime, orchestrator) = setup();
        orchestrator.create_network(&dev_config()).unwrap();

        let mut stray = runtime.spec_named("dev-rpc").unwrap();
        stray.name = "dev-stray".to_string();
        runtime.create_resource(&stray).unwrap();
        assert_eq!(runtime.labelled("dev"), 5);

        orchestrator.destroy_network("dev").unwrap();
        assert_eq!(runtime.container_count(), 0);
    }

    #[test]
    fn test_registry_survives_restart() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().join(".registry");
        let runtime = Arc::new(FakeRuntime::default());

        let first = NetworkOrchestrator::new(
            settings(&dir),
            runtime.clone(),
            Arc::new(JsonFileStore::open(&state_dir).unwrap()),
        );
        let network = first.create_network(&dev_config()).unwrap();
        drop(first);

        let second = NetworkOrchestrator::new(
            settings(&dir),
            runtime.clone(),
            Arc::new(JsonFileStore::open(&state_dir).unwrap()),
        );
        assert_eq!(second.get_network("dev").unwrap(), network);
        assert_eq!(second.list_networks().unwrap()[0].network_id, "dev");

        second.destroy_network("dev").unwrap();
        assert!(second.list_networks().unwrap().is_empty());
        assert_eq!(runtime.labelled("dev"), 0);
    }
}
