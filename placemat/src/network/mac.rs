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

use rand::rngs::OsRng;
use rand::RngCore;

/// Vendor prefix QEMU/KVM uses for guest NICs.
pub const QEMU_MAC_PREFIX: &str = "52:54:00";

/// Generates a MAC address under [QEMU_MAC_PREFIX] with the remaining three
/// octets taken from the operating system's CSPRNG.
pub fn generate_random_mac() -> String {
    let mut octets = [0u8; 3];
    OsRng.fill_bytes(&mut octets);
    format!(
        "{QEMU_MAC_PREFIX}:{:02x}:{:02x}:{:02x}",
        octets[0], octets[1], octets[2]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_mac(mac: &str) -> Option<[u8; 6]> {
        let mut octets = [0u8; 6];
        let mut parts = mac.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next()?;
            if part.len() != 2 {
                return None;
            }
            *octet = u8::from_str_radix(part, 16).ok()?;
        }
        parts.next().is_none().then_some(octets)
    }

    #[test]
    fn generated_mac_is_canonical_and_prefixed() {
        let mac = generate_random_mac();

        assert_eq!(mac.len(), 17);
        assert!(mac.starts_with(QEMU_MAC_PREFIX));
        assert_eq!(mac, mac.to_lowercase());
        let octets = parse_mac(&mac).expect("valid MAC address");
        assert_eq!(&octets[..3], &[0x52, 0x54, 0x00]);
    }

    #[test]
    fn successive_macs_differ() {
        assert_ne!(generate_random_mac(), generate_random_mac());
    }
}
