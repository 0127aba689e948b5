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

use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct Issued {
    counter: u64,
    names: Vec<String>,
}

/// Issues unique device names with a fixed prefix and remembers every name
/// it has handed out so the devices can be removed later.
#[derive(Debug)]
pub struct NameGenerator {
    prefix: String,
    issued: Mutex<Issued>,
}

impl NameGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), issued: Default::default() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Mints a name that has never been returned before.
    pub fn new_name(&self) -> String {
        let mut issued =
            self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        let name = format!("{}{}", self.prefix, issued.counter);
        issued.counter += 1;
        issued.names.push(name.clone());
        name
    }

    /// Every name issued so far, in issuance order.
    pub fn generated_names(&self) -> Vec<String> {
        self.issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .names
            .clone()
    }
}
