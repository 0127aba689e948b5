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

use super::{NetworkError, Result, NAT_CHAIN};
use crate::command::{
    run_and_collect_first_error, run_or_abort, CommandRunner, CommandSpec,
};
use crate::config::NetworkSpec;
use ipnetwork::IpNetwork;
use tracing::info;

/// Parses the host side address of `spec`, if any.
pub(crate) fn bridge_address(spec: &NetworkSpec) -> Result<Option<IpNetwork>> {
    let Some(address) = &spec.address else {
        return Ok(None);
    };
    address.parse::<IpNetwork>().map(Some).map_err(|e| {
        NetworkError::InvalidAddress {
            network: spec.name.clone(),
            address: address.clone(),
            reason: e.to_string(),
        }
    })
}

/// The subnet `address` belongs to, e.g. `10.0.0.0/24` for `10.0.0.1/24`.
fn subnet(address: IpNetwork) -> IpNetwork {
    IpNetwork::new(address.network(), address.prefix()).unwrap_or(address)
}

fn iptables_for(address: IpNetwork) -> &'static str {
    match address {
        IpNetwork::V4(_) => "iptables",
        IpNetwork::V6(_) => "ip6tables",
    }
}

pub(crate) fn create_network_commands(
    spec: &NetworkSpec,
) -> Result<Vec<CommandSpec>> {
    let name = spec.name.as_str();
    let mut commands = vec![
        CommandSpec::new("ip", ["link", "add", name, "type", "bridge"]),
        CommandSpec::new("ip", ["link", "set", name, "up"]),
    ];

    let Some(address) = bridge_address(spec)? else {
        return Ok(commands);
    };
    commands.push(CommandSpec::new(
        "ip",
        ["address", "add", &address.to_string(), "dev", name],
    ));

    if spec.use_nat {
        let iptables = iptables_for(address);
        let subnet = subnet(address).to_string();
        commands.extend([
            CommandSpec::new(
                iptables,
                [
                    "-t", "nat", "-A", NAT_CHAIN, "-s", &subnet, "!", "-d",
                    &subnet, "-j", "MASQUERADE",
                ],
            ),
            CommandSpec::new(
                iptables,
                ["-t", "filter", "-A", NAT_CHAIN, "-i", name, "-j", "ACCEPT"],
            ),
            CommandSpec::new(
                iptables,
                ["-t", "filter", "-A", NAT_CHAIN, "-o", name, "-j", "ACCEPT"],
            ),
        ]);
    }
    Ok(commands)
}

pub(crate) fn destroy_network_commands(
    spec: &NetworkSpec,
) -> Vec<CommandSpec> {
    let name = spec.name.as_str();
    vec![CommandSpec::new("ip", ["link", "delete", name, "type", "bridge"])]
}

/// Creates the bridge for `spec`, assigns its address and installs its NAT
/// rules into the shared chain. The chain must already exist.
pub async fn create_network(
    runner: &dyn CommandRunner,
    spec: &NetworkSpec,
) -> Result<()> {
    info!(network = %spec.name, kind = ?spec.kind, "creating network");
    let commands = create_network_commands(spec)?;
    run_or_abort(runner, &commands).await.map_err(|e| {
        NetworkError::FailedToCreateNetwork {
            network: spec.name.clone(),
            source: e,
        }
    })
}

/// Deletes the bridge. Its NAT rules go away with the chain.
pub async fn destroy_network(
    runner: &dyn CommandRunner,
    spec: &NetworkSpec,
) -> Result<()> {
    Ok(run_and_collect_first_error(runner, &destroy_network_commands(spec))
        .await?)
}
