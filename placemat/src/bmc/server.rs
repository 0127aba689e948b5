/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use super::{
    BmcError, BmcInfo, BmcSignalInterceptor, PowerCommand, PowerControl,
    PowerRequest, PowerResponse, Result, BMC_INFO_QUEUE_SIZE,
};
use crate::command::{CommandRunner, CommandSpec};
use crate::config::{NetworkKind, NetworkSpec};
use crate::network::bridge_address;
use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Default)]
struct Registry {
    vms: HashMap<String, Arc<dyn PowerControl>>,
    /// Announced BMC address to serial.
    addresses: HashMap<IpAddr, String>,
}

impl Registry {
    fn lookup(&self, target: &str) -> Option<Arc<dyn PowerControl>> {
        if let Some(vm) = self.vms.get(target) {
            return Some(vm.clone());
        }
        let address: IpAddr = target.parse().ok()?;
        let serial = self.addresses.get(&address)?;
        self.vms.get(serial).cloned()
    }
}

/// The BMC network: its bridge and the subnet announced addresses must be
/// in.
#[derive(Debug, Clone)]
struct BmcNetwork {
    bridge: String,
    subnet: IpNetwork,
}

/// Registry of running VMs addressable by serial or BMC address, and the
/// power-control endpoint in front of it.
#[derive(Debug)]
pub struct BmcServer {
    runner: Arc<dyn CommandRunner>,
    listen: SocketAddr,
    info_tx: mpsc::Sender<BmcInfo>,
    info_rx: Mutex<Option<mpsc::Receiver<BmcInfo>>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    network: Mutex<Option<BmcNetwork>>,
    registry: Arc<Mutex<Registry>>,
}

impl BmcServer {
    pub fn new(listen: SocketAddr, runner: Arc<dyn CommandRunner>) -> Self {
        let (info_tx, info_rx) = mpsc::channel(BMC_INFO_QUEUE_SIZE);
        Self {
            runner,
            listen,
            info_tx,
            info_rx: Mutex::new(Some(info_rx)),
            listener: Default::default(),
            local_addr: Default::default(),
            network: Default::default(),
            registry: Default::default(),
        }
    }

    /// A sink for the serial output of the VM with `serial`.
    pub fn interceptor(&self, serial: &str) -> BmcSignalInterceptor {
        BmcSignalInterceptor::new(serial, self.info_tx.clone())
    }

    /// Address the power-control endpoint is bound to, once set up.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Binds the power-control endpoint and records the network of type
    /// `bmc`, if any, as the scope of announced addresses.
    pub async fn setup(&self, networks: &[NetworkSpec]) -> Result<()> {
        let bmc_network = networks
            .iter()
            .find(|n| n.kind == NetworkKind::Bmc)
            .map(|n| -> Result<Option<BmcNetwork>> {
                Ok(bridge_address(n)?.map(|address| BmcNetwork {
                    bridge: n.name.clone(),
                    subnet: address,
                }))
            })
            .transpose()?
            .flatten();
        if bmc_network.is_none() {
            debug!(
                "no addressed BMC network, \
                 announced addresses are only used for routing"
            );
        }

        let listener = TcpListener::bind(self.listen).await.map_err(|e| {
            BmcError::FailedToBind { addr: self.listen, source: e }
        })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "BMC server listening");

        *self.network.lock().await = bmc_network;
        *self.local_addr.lock().await = Some(local_addr);
        *self.listener.lock().await = Some(listener);
        Ok(())
    }

    /// Associates a running VM with `serial`. A later registration for the
    /// same serial replaces the earlier one.
    pub async fn register_vm(&self, serial: &str, vm: Arc<dyn PowerControl>) {
        info!(serial, "registering VM");
        let _ = self.registry.lock().await.vms.insert(serial.to_string(), vm);
    }

    /// Forgets `vm` once its process has exited. A newer registration under
    /// the same serial is kept.
    pub async fn unregister_vm(
        &self,
        serial: &str,
        vm: &Arc<dyn PowerControl>,
    ) {
        let mut registry = self.registry.lock().await;
        let registered = registry.vms.get(serial);
        if registered.is_some_and(|current| Arc::ptr_eq(current, vm)) {
            info!(serial, "unregistering VM");
            let _ = registry.vms.remove(serial);
        }
    }

    /// The VM a request for `target`, a serial or an announced BMC address,
    /// would be routed to.
    pub async fn vm(&self, target: &str) -> Option<Arc<dyn PowerControl>> {
        self.registry.lock().await.lookup(target)
    }

    /// Serves announcements and power-control requests until `token` is
    /// cancelled.
    pub async fn handle_node(&self, token: CancellationToken) -> Result<()> {
        let mut info_rx =
            self.info_rx.lock().await.take().ok_or(BmcError::NotSetUp)?;
        let listener =
            self.listener.lock().await.take().ok_or(BmcError::NotSetUp)?;
        // aborted when this loop returns
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                Some(info) = info_rx.recv() => self.add_bmc(info).await,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let registry = self.registry.clone();
                        let span = info_span!("bmc connection", %peer);
                        let _ = connections.spawn(
                            serve_connection(stream, registry).instrument(span),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept BMC connection");
                    }
                },
                Some(_) = connections.join_next() => {}
            }
        }
    }

    async fn add_bmc(&self, info: BmcInfo) {
        let BmcInfo { serial, address } = info;
        let ip = match address.parse::<IpNetwork>() {
            Ok(network) => network.ip(),
            Err(e) => {
                warn!(
                    %serial,
                    %address,
                    error = %e,
                    "ignoring invalid BMC address"
                );
                return;
            }
        };

        if let Some(network) = self.network.lock().await.clone() {
            if !network.subnet.contains(ip) {
                warn!(
                    %serial,
                    %address,
                    bridge = %network.bridge,
                    "ignoring BMC address outside the BMC network"
                );
                return;
            }
            let host = format!("{ip}/{}", network.subnet.prefix());
            let command = CommandSpec::new(
                "ip",
                ["address", "add", &host, "dev", &network.bridge],
            );
            if let Err(e) = self.runner.run(&command).await {
                error!(
                    %serial,
                    %address,
                    error = %e,
                    "failed to add BMC address"
                );
                return;
            }
        }

        info!(%serial, %address, "BMC address registered");
        let _ = self.registry.lock().await.addresses.insert(ip, serial);
    }
}

async fn dispatch(
    registry: &Mutex<Registry>,
    request: &PowerRequest,
) -> std::result::Result<bool, BmcError> {
    let vm = registry
        .lock()
        .await
        .lookup(&request.target)
        .ok_or_else(|| BmcError::UnknownTarget {
            target: request.target.clone(),
        })?;

    debug!(
        bmc_target = %request.target,
        command = %request.command,
        "power request"
    );
    match request.command {
        PowerCommand::On => vm.power_on().await,
        PowerCommand::Off => vm.power_off().await,
        PowerCommand::Status => {}
        PowerCommand::Cycle => {
            vm.power_off().await;
            vm.power_on().await;
        }
    }
    Ok(vm.is_running().await)
}

async fn serve_connection(stream: TcpStream, registry: Arc<Mutex<Registry>>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "BMC connection closed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match line.parse::<PowerRequest>() {
            Ok(request) => {
                PowerResponse::from(dispatch(&registry, &request).await)
            }
            Err(e) => PowerResponse::from(Err(e)),
        };
        let response = format!("{response}\n");
        if let Err(e) = writer.write_all(response.as_bytes()).await {
            debug!(error = %e, "BMC connection closed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct FakeVm {
        running: AtomicBool,
        commands: std::sync::Mutex<Vec<&'static str>>,
    }

    impl FakeVm {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                running: AtomicBool::new(true),
                commands: Default::default(),
            })
        }
        fn commands(&self) -> Vec<&'static str> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl PowerControl for FakeVm {
        async fn power_on(&self) {
            self.commands.lock().unwrap().push("on");
            self.running.store(true, Ordering::SeqCst);
        }
        async fn power_off(&self) {
            self.commands.lock().unwrap().push("off");
            self.running.store(false, Ordering::SeqCst);
        }
        async fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    fn bmc_network() -> Vec<NetworkSpec> {
        vec![NetworkSpec {
            name: "bmc-net".into(),
            kind: NetworkKind::Bmc,
            use_nat: false,
            address: Some("10.72.16.1/20".into()),
        }]
    }

    fn server(runner: &RecordingRunner) -> Arc<BmcServer> {
        let listen = SocketAddr::from(([127, 0, 0, 1], 0));
        Arc::new(BmcServer::new(listen, Arc::new(runner.clone())))
    }

    async fn request(stream: &mut BufReader<TcpStream>, line: &str) -> String {
        stream.get_mut().write_all(format!("{line}\n").as_bytes()).await.unwrap();
        let mut response = String::new();
        let _ = stream.read_line(&mut response).await.unwrap();
        response.trim_end().to_string()
    }

    #[tokio::test]
    async fn routes_requests_by_serial_and_announced_address() {
        let runner = RecordingRunner::new();
        let server = server(&runner);
        server.setup(&bmc_network()).await.unwrap();
        let addr = server.local_addr().await.unwrap();

        let token = CancellationToken::new();
        let handler = tokio::spawn({
            let server = server.clone();
            let token = token.clone();
            async move { server.handle_node(token).await }
        });

        let vm = FakeVm::new();
        server.register_vm("serial-0", vm.clone()).await;
        server.interceptor("serial-0").write_all(b"10.72.17.5\n").unwrap();

        let mut stream = BufReader::new(TcpStream::connect(addr).await.unwrap());
        assert_eq!(request(&mut stream, "serial-0 power-status").await, "ok on");
        assert_eq!(request(&mut stream, "serial-0 power-off").await, "ok off");

        // the announcement is processed by the handler loop
        let mut answer = String::new();
        for _ in 0..50 {
            answer = request(&mut stream, "10.72.17.5 power-on").await;
            if answer == "ok on" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(answer, "ok on");
        assert_eq!(vm.commands(), vec!["off", "on"]);
        assert_eq!(
            runner.commands_starting_with(&["ip", "address", "add"])[0].to_string(),
            "ip address add 10.72.17.5/20 dev bmc-net"
        );

        assert!(request(&mut stream, "nobody power-on").await.starts_with("error "));
        assert!(request(&mut stream, "serial-0 reboot").await.starts_with("error "));

        token.cancel();
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn addresses_outside_the_bmc_network_are_ignored() {
        let runner = RecordingRunner::new();
        let server = server(&runner);
        server.setup(&bmc_network()).await.unwrap();

        server
            .add_bmc(BmcInfo { serial: "s".into(), address: "192.168.0.1".into() })
            .await;
        server
            .add_bmc(BmcInfo { serial: "s".into(), address: "not-an-ip".into() })
            .await;

        assert!(runner.commands().is_empty());
        assert!(server.registry.lock().await.addresses.is_empty());
    }

    #[tokio::test]
    async fn power_cycle_stops_then_starts() {
        let registry = Mutex::new(Registry::default());
        let vm = FakeVm::new();
        let _ = registry.lock().await.vms.insert("s".into(), vm.clone());

        let request = PowerRequest { target: "s".into(), command: PowerCommand::Cycle };
        assert!(dispatch(&registry, &request).await.unwrap());
        assert_eq!(vm.commands(), vec!["off", "on"]);
    }

    #[tokio::test]
    async fn registration_is_last_write_wins() {
        let server = server(&RecordingRunner::new());
        let first = FakeVm::new();
        let second = FakeVm::new();
        server.register_vm("s", first.clone()).await;
        server.register_vm("s", second.clone()).await;

        let request = PowerRequest { target: "s".into(), command: PowerCommand::Off };
        let _ = dispatch(&server.registry, &request).await.unwrap();
        assert!(first.commands().is_empty());
        assert_eq!(second.commands(), vec!["off"]);
    }

    #[tokio::test]
    async fn requests_after_unregister_find_no_machine() {
        let server = server(&RecordingRunner::new());
        let vm: Arc<dyn PowerControl> = FakeVm::new();
        server.register_vm("s", vm.clone()).await;
        assert!(server.vm("s").await.is_some());

        server.unregister_vm("s", &vm).await;

        assert!(server.vm("s").await.is_none());
        let request = PowerRequest { target: "s".into(), command: PowerCommand::Status };
        let err = dispatch(&server.registry, &request).await.unwrap_err();
        assert!(matches!(err, BmcError::UnknownTarget { .. }));
        assert!(err.to_string().starts_with("no machine registered"));
    }

    #[tokio::test]
    async fn stale_unregister_keeps_the_newer_vm() {
        let server = server(&RecordingRunner::new());
        let old: Arc<dyn PowerControl> = FakeVm::new();
        let new: Arc<dyn PowerControl> = FakeVm::new();
        server.register_vm("s", old.clone()).await;
        server.register_vm("s", new.clone()).await;

        server.unregister_vm("s", &old).await;

        let current = server.vm("s").await.unwrap();
        assert!(Arc::ptr_eq(&current, &new));
    }

    #[tokio::test]
    async fn handle_node_requires_setup() {
        let server = server(&RecordingRunner::new());
        let err = server.handle_node(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BmcError::NotSetUp));
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let server = BmcServer::new(addr, Arc::new(RecordingRunner::new()));

        let err = server.setup(&[]).await.unwrap_err();
        assert!(matches!(err, BmcError::FailedToBind { .. }));
    }
}
