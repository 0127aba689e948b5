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

//! Line based power-control protocol.
//!
//! A request is a single line `<target> <command>`, where the target is a
//! node serial or an announced BMC address. Each request is answered with a
//! single line: `ok on`, `ok off` or `error <message>`.

use super::BmcError;
use std::fmt::{self, Display};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCommand {
    On,
    Off,
    Status,
    /// Stop followed by reset and continue.
    Cycle,
}

impl FromStr for PowerCommand {
    type Err = BmcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "power-on" => Ok(Self::On),
            "power-off" => Ok(Self::Off),
            "power-status" => Ok(Self::Status),
            "power-cycle" => Ok(Self::Cycle),
            other => Err(BmcError::UnknownCommand(other.into())),
        }
    }
}

impl Display for PowerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::On => "power-on",
            Self::Off => "power-off",
            Self::Status => "power-status",
            Self::Cycle => "power-cycle",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerRequest {
    pub target: String,
    pub command: PowerCommand,
}

impl FromStr for PowerRequest {
    type Err = BmcError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| BmcError::MalformedRequest {
            request: line.trim().into(),
            reason: reason.into(),
        };

        let mut words = line.split_whitespace();
        let target = words.next().ok_or_else(|| malformed("missing target"))?;
        let command =
            words.next().ok_or_else(|| malformed("missing command"))?;
        if words.next().is_some() {
            return Err(malformed("trailing arguments"));
        }

        Ok(Self { target: target.into(), command: command.parse()? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerResponse {
    Ok { running: bool },
    Error(String),
}

impl From<Result<bool, BmcError>> for PowerResponse {
    fn from(result: Result<bool, BmcError>) -> Self {
        match result {
            Ok(running) => Self::Ok { running },
            Err(e) => Self::Error(e.to_string()),
        }
    }
}

impl Display for PowerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok { running: true } => f.write_str("ok on"),
            Self::Ok { running: false } => f.write_str("ok off"),
            // keep the response on one line
            Self::Error(message) => {
                write!(f, "error {}", message.replace('\n', " "))
            }
        }
    }
}
