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

//! Host network plumbing for nodes and pods.
//!
//! Devices are created with `ip`, NAT isolation uses a dedicated
//! `iptables`/`ip6tables` chain named [NAT_CHAIN]. Every operation is a
//! sequence of [CommandSpec]s built by a pure function and executed with one
//! of the strategies from [crate::command].

pub use self::{
    bridge::{create_network, destroy_network},
    error::NetworkError,
    mac::{generate_random_mac, QEMU_MAC_PREFIX},
    names::NameGenerator,
};
pub(crate) use self::bridge::bridge_address;
use crate::command::{
    run_and_collect_first_error, run_or_abort, CommandRunner, CommandSpec,
};
use std::collections::HashMap;
use tracing::info;

mod bridge;
mod error;
mod mac;
mod names;

pub type Result<T> = std::result::Result<T, NetworkError>;

pub const TAP_PREFIX: &str = "pmtap";
pub const VETH_PREFIX: &str = "pmveth";
pub const POD_NS_PREFIX: &str = "pm_";
pub const NAT_CHAIN: &str = "PLACEMAT";

const IPTABLES: [&str; 2] = ["iptables", "ip6tables"];

/// Name of the network namespace hosting `pod`.
pub fn pod_namespace(pod: &str) -> String {
    format!("{POD_NS_PREFIX}{pod}")
}

/// The end of a veth pair that stays on the host, attached to the bridge.
pub fn veth_peer(veth: &str) -> String {
    format!("{veth}_")
}

fn ip<I, S>(args: I) -> CommandSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CommandSpec::new("ip", args)
}

pub fn create_tap_commands(tap: &str, bridge: &str) -> Vec<CommandSpec> {
    vec![
        ip(["tuntap", "add", tap, "mode", "tap"]),
        ip(["link", "set", tap, "master", bridge]),
        ip(["link", "set", tap, "up"]),
    ]
}

pub fn delete_tap_command(tap: &str) -> CommandSpec {
    ip(["tuntap", "delete", tap, "mode", "tap"])
}

pub fn create_veth_commands(veth: &str, bridge: &str) -> Vec<CommandSpec> {
    let peer = veth_peer(veth);
    vec![
        ip(["link", "add", veth, "type", "veth", "peer", "name", &peer]),
        ip(["link", "set", &peer, "master", bridge, "up"]),
    ]
}

pub fn delete_veth_command(veth: &str) -> CommandSpec {
    ip(["link", "delete", &veth_peer(veth)])
}

/// Builds the namespace for `pod`, moving `veths[i]` into it as `eth<i>`
/// and assigning the addresses listed for it in `addresses`.
pub fn make_pod_ns_commands(
    pod: &str,
    veths: &[String],
    addresses: &HashMap<String, Vec<String>>,
) -> Vec<CommandSpec> {
    let ns = pod_namespace(pod);
    // the kernel assigns 127.0.0.1 to lo
    let mut commands = vec![
        ip(["netns", "add", &ns]),
        ip(["netns", "exec", &ns, "ip", "link", "set", "lo", "up"]),
    ];

    for (i, veth) in veths.iter().enumerate() {
        let eth = format!("eth{i}");
        commands
            .push(ip(["link", "set", veth, "netns", &ns, "name", &eth, "up"]));
        for address in addresses.get(veth).into_iter().flatten() {
            commands.push(ip([
                "netns", "exec", &ns, "ip", "a", "add", address, "dev", &eth,
            ]));
        }
    }
    commands
}

pub fn run_in_pod_ns_command(pod: &str, script: &str) -> CommandSpec {
    ip(["netns", "exec", &pod_namespace(pod), script])
}

pub fn delete_pod_ns_command(pod: &str) -> CommandSpec {
    ip(["netns", "del", &pod_namespace(pod)])
}

pub fn create_nat_rules_commands() -> Vec<CommandSpec> {
    IPTABLES
        .iter()
        .flat_map(|iptables| {
            [
                vec!["-N", NAT_CHAIN, "-t", "filter"],
                vec!["-N", NAT_CHAIN, "-t", "nat"],
                vec!["-t", "nat", "-A", "POSTROUTING", "-j", NAT_CHAIN],
                vec!["-t", "filter", "-A", "FORWARD", "-j", NAT_CHAIN],
            ]
            .into_iter()
            .map(move |args| CommandSpec::new(*iptables, args))
        })
        .collect()
}

pub fn destroy_nat_rules_commands() -> Vec<CommandSpec> {
    IPTABLES
        .iter()
        .flat_map(|iptables| {
            [
                vec!["-t", "filter", "-D", "FORWARD", "-j", NAT_CHAIN],
                vec!["-t", "nat", "-D", "POSTROUTING", "-j", NAT_CHAIN],
                vec!["-F", NAT_CHAIN, "-t", "filter"],
                vec!["-X", NAT_CHAIN, "-t", "filter"],
                vec!["-F", NAT_CHAIN, "-t", "nat"],
                vec!["-X", NAT_CHAIN, "-t", "nat"],
            ]
            .into_iter()
            .map(move |args| CommandSpec::new(*iptables, args))
        })
        .collect()
}

pub async fn create_tap(
    runner: &dyn CommandRunner,
    tap: &str,
    bridge: &str,
) -> Result<()> {
    info!(tap, bridge, "creating tap");
    run_or_abort(runner, &create_tap_commands(tap, bridge)).await.map_err(
        |e| NetworkError::FailedToCreateTap {
            tap: tap.into(),
            bridge: bridge.into(),
            source: e,
        },
    )
}

pub async fn delete_tap(runner: &dyn CommandRunner, tap: &str) -> Result<()> {
    Ok(runner.run(&delete_tap_command(tap)).await?)
}

pub async fn create_veth(
    runner: &dyn CommandRunner,
    veth: &str,
    bridge: &str,
) -> Result<()> {
    info!(veth, bridge, "creating veth pair");
    run_or_abort(runner, &create_veth_commands(veth, bridge)).await.map_err(
        |e| NetworkError::FailedToCreateVeth {
            veth: veth.into(),
            bridge: bridge.into(),
            source: e,
        },
    )
}

pub async fn delete_veth(runner: &dyn CommandRunner, veth: &str) -> Result<()> {
    Ok(runner.run(&delete_veth_command(veth)).await?)
}

pub async fn make_pod_ns(
    runner: &dyn CommandRunner,
    pod: &str,
    veths: &[String],
    addresses: &HashMap<String, Vec<String>>,
) -> Result<()> {
    info!(pod, "creating pod network namespace");
    run_or_abort(runner, &make_pod_ns_commands(pod, veths, addresses))
        .await
        .map_err(|e| NetworkError::FailedToCreatePodNamespace {
            pod: pod.into(),
            source: e,
        })
}

pub async fn run_in_pod_ns(
    runner: &dyn CommandRunner,
    pod: &str,
    script: &str,
) -> Result<()> {
    runner.run(&run_in_pod_ns_command(pod, script)).await.map_err(|e| {
        NetworkError::InitScriptFailed {
            pod: pod.into(),
            script: script.into(),
            source: e,
        }
    })
}

pub async fn delete_pod_ns(
    runner: &dyn CommandRunner,
    pod: &str,
) -> Result<()> {
    Ok(runner.run(&delete_pod_ns_command(pod)).await?)
}

pub async fn create_nat_rules(runner: &dyn CommandRunner) -> Result<()> {
    info!(chain = NAT_CHAIN, "creating NAT rules");
    run_or_abort(runner, &create_nat_rules_commands())
        .await
        .map_err(|e| NetworkError::FailedToCreateNatRules { source: e })
}

/// Removes the NAT chain. Every command is attempted.
pub async fn destroy_nat_rules(runner: &dyn CommandRunner) -> Result<()> {
    Ok(run_and_collect_first_error(runner, &destroy_nat_rules_commands())
        .await?)
}
