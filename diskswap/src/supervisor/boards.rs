//! Machine-name to OS board-slug mapping.

use diskswap_shared::{DiskswapError, DiskswapResult};

/// Fixed machine → board-slug table. Release artifacts are published per
/// board slug, which does not always equal the machine name.
const MACHINE_TO_SLUG: &[(&str, &str)] = &[
    ("raspberrypi3", "rpi3"),
    ("raspberrypi3-64", "rpi3-64"),
    ("raspberrypi4", "rpi4"),
    ("raspberrypi4-64", "rpi4-64"),
    ("raspberrypi5-64", "rpi5-64"),
    ("generic-x86-64", "generic-x86-64"),
    ("generic-aarch64", "generic-aarch64"),
    ("odroid-c2", "odroid-c2"),
    ("odroid-c4", "odroid-c4"),
    ("odroid-m1", "odroid-m1"),
    ("odroid-n2", "odroid-n2"),
    ("odroid-xu", "odroid-xu"),
    ("tinker", "tinker"),
    ("khadas-vim3", "khadas-vim3"),
    ("green", "green"),
    ("yellow", "yellow"),
    ("qemuarm-64", "generic-aarch64"),
    ("qemux86-64", "generic-x86-64"),
];

/// Map a machine identifier to its board slug. An unmapped machine is a
/// fatal configuration error: there is no image to download for it.
pub fn machine_to_board_slug(machine: &str) -> DiskswapResult<&'static str> {
    MACHINE_TO_SLUG
        .iter()
        .find(|(m, _)| *m == machine)
        .map(|(_, slug)| *slug)
        .ok_or_else(|| DiskswapError::Supervisor(format!("unsupported machine type: {}", machine)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_machines() {
        assert_eq!(machine_to_board_slug("raspberrypi4-64").unwrap(), "rpi4-64");
        assert_eq!(machine_to_board_slug("yellow").unwrap(), "yellow");
        // Emulated machines map onto generic boards
        assert_eq!(
            machine_to_board_slug("qemux86-64").unwrap(),
            "generic-x86-64"
        );
    }

    #[test]
    fn unmapped_machine_is_fatal() {
        let err = machine_to_board_slug("toaster-9000").unwrap_err();
        assert!(err.to_string().contains("unsupported machine type"));
    }
}
