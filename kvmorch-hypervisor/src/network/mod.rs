//! Virtual network management.
//!
//! Bridged network objects on the daemon, plus adding and removing
//! guest NICs on those networks.

mod manager;

pub use manager::NetworkManager;

/// Generate a random MAC address in the KVM `52:54:00` prefix.
pub fn generate_mac_address() -> String {
    let bytes: [u8; 3] = rand::random();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        bytes[0] & 0x3f,
        bytes[1],
        bytes[2]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_mac_format() {
        let mac = generate_mac_address();

        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
        assert!(mac.split(':').all(|b| u8::from_str_radix(b, 16).is_ok()));
    }
}
