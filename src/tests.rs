#[cfg(test)]
mod tests {
    use crate::check::CheckError;
    use crate::error::RustVtlError;

    #[test]
    fn test_error_creation() {
        let structural = RustVtlError::structural("missing page");
        assert!(matches!(structural, RustVtlError::Structural(_)));

        let device = RustVtlError::device("drive busy");
        assert!(matches!(device, RustVtlError::Device(_)));
        assert_eq!(device.to_string(), "Device graph error: drive busy");
    }

    #[test]
    fn test_check_error_conversion() {
        let missing: RustVtlError = CheckError::MissingIndex { bid: 2, index_id: 7 }.into();
        assert!(matches!(missing, RustVtlError::Structural(_)));
        assert!(missing.to_string().contains("index at id 7 for bint 2"));

        let unknown: RustVtlError = CheckError::UnknownDisk(9).into();
        assert!(matches!(unknown, RustVtlError::Structural(_)));

        let persist: RustVtlError = CheckError::PersistFailed {
            bid: 1,
            index_id: 0,
            source: Box::new(RustVtlError::structural("write refused")),
        }
        .into();
        assert!(matches!(persist, RustVtlError::Io(_)));

        let page: RustVtlError = CheckError::PageAllocation { bid: 1, index_id: 3 }.into();
        assert!(matches!(page, RustVtlError::Allocation(_)));
    }

    #[test]
    fn test_structural_classification() {
        assert!(CheckError::UnknownDisk(1).is_structural());
        assert!(CheckError::MissingIndex { bid: 1, index_id: 0 }.is_structural());
        assert!(!CheckError::PageAllocation { bid: 1, index_id: 0 }.is_structural());
    }

    #[test]
    fn test_allocation_error_from_reserve() {
        let mut buf: Vec<u8> = Vec::new();
        let err = buf.try_reserve(usize::MAX).unwrap_err();
        assert!(matches!(RustVtlError::from(err), RustVtlError::Allocation(_)));
    }
}

#[cfg(test)]
mod integration_tests {
    use crate::bdev::{index_lba, BlockInterface, FileBlockStore, LBA_SIZE, UNIT_SIZE};
    use crate::check::{self, CheckError, CheckMode, CheckReport};
    use crate::cli::{Cli, Commands};
    use crate::config::LibraryConfig;
    use crate::library::Library;
    use crate::tape::{FormatVersion, SegmentKind};
    use clap::Parser;
    use std::io::{Seek, SeekFrom, Write};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_format_command_parsing() {
        let args = vec![
            "rustvtl", "format", "/srv/vtl/disk1.img", "-b", "1", "-s", "1073741824", "--register",
        ];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Format {
                path,
                bid,
                size,
                register,
            } => {
                assert_eq!(path, PathBuf::from("/srv/vtl/disk1.img"));
                assert_eq!(bid, 1);
                assert_eq!(size, 1 << 30);
                assert!(register);
            }
            _ => panic!("Expected Format command"),
        }
    }

    #[test]
    fn test_format_requires_bid() {
        let args = vec!["rustvtl", "format", "disk.img", "-s", "1024"];
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_space_command_parsing() {
        let cli = Cli::try_parse_from(vec!["rustvtl", "space", "--detailed"]).unwrap();
        assert!(matches!(cli.command, Commands::Space { detailed: true }));
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_check_command_parsing() {
        let args = vec![
            "rustvtl", "check", "--dry-run", "-p", "-r", "out.csv", "--config", "lib.xml", "-v",
        ];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("lib.xml")));
        match cli.command {
            Commands::Check {
                disk,
                dry_run,
                parallel,
                report,
                json,
            } => {
                assert_eq!(disk, None);
                assert!(dry_run);
                assert!(parallel);
                assert_eq!(report, Some(PathBuf::from("out.csv")));
                assert!(!json);
            }
            _ => panic!("Expected Check command"),
        }

        let cli = Cli::try_parse_from(vec!["rustvtl", "check", "-d", "3", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Check {
                disk: Some(3),
                json: true,
                ..
            }
        ));
    }

    /// Leak a unit on a file-backed library, reopen it from its saved
    /// configuration and let the checker reclaim the leak.
    #[test]
    fn test_repair_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("disk1.img");
        let config_file = dir.path().join("library.xml");
        let size = 16 * UNIT_SIZE;

        let store = FileBlockStore::create(&image, size).unwrap();
        BlockInterface::format(1, size, Arc::new(store)).unwrap();

        let mut library = Library::new();
        library.attach_disk_file(1, &image).unwrap();
        let cart = library
            .create_cartridge("VTL100", FormatVersion::V1, &[8 * UNIT_SIZE], Some(1))
            .unwrap();
        let drive = library.add_drive("drive0").unwrap();
        library.load_drive(drive, cart).unwrap();
        library.write_segment(cart, 0, SegmentKind::Data).unwrap();
        library.write_segment(cart, 0, SegmentKind::Meta).unwrap();

        // allocated but never referenced by any map
        library.bints_mut().allocate_unit(Some(1)).unwrap();
        let leaked_free = library.bints().get(1).unwrap().free();
        library.to_config().save(&config_file).unwrap();
        drop(library);

        let mut library = Library::from_config(&LibraryConfig::load(&config_file).unwrap()).unwrap();
        assert_eq!(library.bints().get(1).unwrap().free(), leaked_free);

        let checks = check::check_all_disks(&mut library, CheckMode::Repair);
        assert_eq!(checks.len(), 1);
        let outcome = checks[0].result.as_ref().unwrap();
        assert_eq!(outcome.reclaimed, 1);
        assert_eq!(outcome.restored, 0);
        assert_eq!(outcome.free_after, leaked_free + UNIT_SIZE);
        drop(library);

        let mut library = Library::from_config(&LibraryConfig::load(&config_file).unwrap()).unwrap();
        assert_eq!(library.bints().get(1).unwrap().free(), leaked_free + UNIT_SIZE);
        let checks = check::check_all_disks(&mut library, CheckMode::Repair);
        assert!(checks[0].result.as_ref().unwrap().is_clean());
    }

    fn format_image(path: &Path, bid: u32, units: u64) {
        let size = units * UNIT_SIZE;
        let store = FileBlockStore::create(path, size).unwrap();
        BlockInterface::format(bid, size, Arc::new(store)).unwrap();
    }

    /// One disk with a damaged bitmap page must not keep the others from
    /// being opened and checked.
    #[test]
    fn test_corrupt_page_fails_only_its_disk() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("disk1.img");
        let second = dir.path().join("disk2.img");
        let config_file = dir.path().join("library.xml");
        format_image(&first, 1, 16);
        format_image(&second, 2, 16);

        let mut library = Library::new();
        library.attach_disk_file(1, &first).unwrap();
        library.attach_disk_file(2, &second).unwrap();
        library.bints_mut().allocate_unit(Some(1)).unwrap();
        library.to_config().save(&config_file).unwrap();
        drop(library);

        let mut image = std::fs::OpenOptions::new()
            .write(true)
            .open(&second)
            .unwrap();
        image
            .seek(SeekFrom::Start(index_lba(0) * LBA_SIZE as u64))
            .unwrap();
        image.write_all(&[0xAB; 16]).unwrap();
        image.sync_all().unwrap();
        drop(image);

        let mut library = Library::from_config(&LibraryConfig::load(&config_file).unwrap()).unwrap();
        assert_eq!(library.bints().len(), 2);
        assert!(!library.bints().get(1).unwrap().is_degraded());
        assert!(library.bints().get(2).unwrap().is_degraded());
        let usage = library.disk_usage();
        assert!(usage.iter().any(|d| d.bid == 2 && d.degraded));

        let checks = check::check_all_disks(&mut library, CheckMode::Repair);
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].bid, 1);
        assert_eq!(checks[0].result.as_ref().unwrap().reclaimed, 1);
        assert_eq!(checks[1].bid, 2);
        assert!(matches!(
            checks[1].result,
            Err(CheckError::MissingIndex { bid: 2, index_id: 0 })
        ));

        let report = CheckReport::from_checks(CheckMode::Repair, &checks);
        assert_eq!(report.failures(), 1);
    }
}
