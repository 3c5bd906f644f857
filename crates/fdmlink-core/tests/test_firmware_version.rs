use fdmlink_core::{needs_update, FirmwareVersion, MachineFamily};

#[test]
fn test_prerelease_always_upgradable() {
    let latest = FirmwareVersion::new(1, 4, 0);
    let current = FirmwareVersion::parse("1.4.0-rc1").unwrap();
    assert!(current.is_prerelease());
    assert!(needs_update(Some(&current), &latest));

    let newer_prerelease = FirmwareVersion::parse("1.5.0-beta").unwrap();
    assert!(needs_update(Some(&newer_prerelease), &latest));
}

#[test]
fn test_equal_release_is_latest() {
    let latest = FirmwareVersion::parse("v1.4.0").unwrap();
    let current = FirmwareVersion::new(1, 4, 0).with_family(MachineFamily::SigmaX);
    assert_eq!(current, latest);
    assert!(!needs_update(Some(&current), &latest));
    assert!(!needs_update(Some(&FirmwareVersion::new(1, 5, 0)), &latest));
}

#[test]
fn test_unknown_or_older_needs_update() {
    let latest = FirmwareVersion::new(2, 0, 0);
    assert!(needs_update(None, &latest));
    assert!(needs_update(Some(&FirmwareVersion::new(1, 9, 9)), &latest));
}

#[test]
fn test_banner_reports_family() {
    let version = FirmwareVersion::from_banner(
        "FIRMWARE_NAME:Marlin FIRMWARE_VERSION:1.2.3 MACHINE_TYPE:Sigma X EXTRUDER_COUNT:2",
    )
    .unwrap();
    assert_eq!(version, FirmwareVersion::new(1, 2, 3));
    assert_eq!(version.family, Some(MachineFamily::SigmaX));

    assert_eq!(
        FirmwareVersion::from_banner("1.0.1"),
        Some(FirmwareVersion::new(1, 0, 1))
    );
    assert!(FirmwareVersion::from_banner("echo:busy: processing").is_none());
}
