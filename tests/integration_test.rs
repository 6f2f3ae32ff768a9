//! End-to-end scenarios exercising the three engines together through a
//! real file or pipe, rather than through any one module's internals.

use silk_core::bag::format::FormatVersion as BagFormatVersion;
use silk_core::bag::FieldType;
use silk_core::stream::{CompressionMethod, FileFormat, FileHeader};
use silk_core::{Bag, ContentType, Family, IpSet, IpSetError, Mode, Stream, V6Policy};

fn v4(a: u8, b: u8, c: u8, d: u8) -> u128 {
    u32::from_be_bytes([a, b, c, d]) as u128
}

#[test]
fn s1_mask_then_clean_yields_host_representatives() {
    let mut set = IpSet::create(Family::V4);
    set.insert(Family::V4, v4(10, 0, 0, 23), 32).unwrap();
    set.insert(Family::V4, v4(10, 0, 1, 0), 24).unwrap();
    set.insert(Family::V4, v4(10, 7, 1, 0), 24).unwrap();
    set.insert(Family::V4, v4(20, 20, 0, 243), 32).unwrap();
    set.insert(Family::V4, v4(32, 32, 0, 0), 15).unwrap();

    set.mask(16);
    set.clean();

    let mut seen = Vec::new();
    set.walk(true, V6Policy::Mix, |_family, base, prefix| {
        seen.push((base, prefix));
    })
    .unwrap();

    let expected = vec![
        (v4(10, 0, 0, 0), 32),
        (v4(10, 7, 0, 0), 32),
        (v4(20, 20, 0, 0), 32),
        (v4(32, 32, 0, 0), 32),
        (v4(32, 33, 0, 0), 32),
    ];
    assert_eq!(seen, expected);
}

#[test]
fn s2_mask_and_fill_keeps_enclosing_networks() {
    let mut set = IpSet::create(Family::V4);
    set.insert(Family::V4, v4(10, 0, 0, 23), 32).unwrap();
    set.insert(Family::V4, v4(10, 0, 1, 0), 24).unwrap();
    set.insert(Family::V4, v4(10, 7, 1, 0), 24).unwrap();
    set.insert(Family::V4, v4(20, 20, 0, 243), 32).unwrap();
    set.insert(Family::V4, v4(32, 32, 0, 0), 15).unwrap();

    set.mask_and_fill(16);
    set.clean();

    let blocks = set.blocks().unwrap();
    let expected = vec![
        (v4(10, 0, 0, 0), 16),
        (v4(10, 7, 0, 0), 16),
        (v4(20, 20, 0, 0), 16),
        (v4(32, 32, 0, 0), 15),
    ];
    assert_eq!(blocks, expected);
}

#[test]
fn s3_auto_convert_promotes_v4_set_to_v6() {
    let v6_addr = 0x2001_0db8_0000_0000_0000_0000_0000_0001u128;

    let mut set = IpSet::create(Family::V4);
    set.insert(Family::V6, v6_addr, 128).unwrap();
    assert_eq!(set.family(), Family::V6);
    assert!(set.contains(Family::V6, v6_addr));

    let mut strict = IpSet::create(Family::V4);
    strict.auto_convert_disable();
    let err = strict.insert(Family::V6, v6_addr, 128).unwrap_err();
    assert!(matches!(err, IpSetError::Ipv6));
    assert_eq!(strict.family(), Family::V4);
    assert!(strict.is_empty());
}

#[test]
fn s4_bag_overflow_then_underflow_to_removal() {
    let mut bag = Bag::create(FieldType::SIPv4, FieldType::Packets, 4);
    bag.add(0x0A00_0001, 1).unwrap();
    let counter = bag.add(0x0A00_0001, u64::MAX - 1).unwrap();
    assert_eq!(counter, u64::MAX);

    let err = bag.add(0x0A00_0001, 1).unwrap_err();
    assert!(matches!(err, silk_core::BagError::OpBounds));
    assert_eq!(bag.get(0x0A00_0001), u64::MAX);

    let remaining = bag.subtract(0x0A00_0001, u64::MAX).unwrap();
    assert_eq!(remaining, 0);
    assert_eq!(bag.count_keys(), 0);
}

#[test]
fn s5_bag_auto_widens_past_two_octets() {
    let mut bag = Bag::create_untyped(2);
    bag.add(0x1234, 7).unwrap();
    bag.add(0x1_0000, 3).unwrap();

    assert!(bag.key_octets() >= 4);
    assert_eq!(bag.get(0x1234), 7);
    assert_eq!(bag.get(0x1_0000), 3);
}

#[test]
fn s6_bag_round_trips_over_a_pipe_with_zlib() {
    let mut bag = Bag::create(FieldType::SIPv4, FieldType::Packets, 4);
    bag.add(0x0A00_0001, 1).unwrap();
    bag.subtract(0x0A00_0001, 1).unwrap();
    assert_eq!(bag.count_keys(), 0);

    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let mut writer = Stream::create(Mode::Write, ContentType::Binary);
    writer.bind_fd(write_fd).unwrap();
    writer.open().unwrap();
    bag.write(&mut writer, CompressionMethod::Zlib, Some(BagFormatVersion::V3)).unwrap();
    writer.close().unwrap();

    let mut reader = Stream::create(Mode::Read, ContentType::Binary);
    reader.bind_fd(read_fd).unwrap();
    reader.open().unwrap();
    let back = Bag::read(&mut reader).unwrap();

    assert_eq!(back.count_keys(), bag.count_keys());
    assert_eq!(back.get(0x0A00_0001), 0);
}

#[test]
fn s7_unsupported_file_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.ips");

    let mut writer = Stream::create(Mode::Write, ContentType::Binary);
    writer.bind_path(&path).unwrap();
    writer.open().unwrap();
    writer.write_header(FileHeader::new(FileFormat::IpSet, 99, 4)).unwrap();
    writer.close().unwrap();

    let mut reader = Stream::create(Mode::Read, ContentType::Binary);
    reader.bind_path(&path).unwrap();
    reader.open().unwrap();
    let err = IpSet::read(&mut reader).unwrap_err();
    assert!(matches!(err, IpSetError::FileVersion(99)));
}

#[test]
fn ipset_set_algebra_matches_pointwise_membership() {
    let mut a = IpSet::create(Family::V4);
    a.insert(Family::V4, v4(10, 0, 0, 0), 24).unwrap();
    let mut b = IpSet::create(Family::V4);
    b.insert(Family::V4, v4(10, 0, 0, 128), 25).unwrap();

    let probes = [v4(10, 0, 0, 1), v4(10, 0, 0, 200), v4(192, 168, 0, 1)];

    let mut union = a.copy();
    union.union(&b).unwrap();
    let mut intersect = a.copy();
    intersect.intersect(&b).unwrap();
    let mut subtract = a.copy();
    subtract.subtract(&b).unwrap();

    for &p in &probes {
        assert_eq!(
            union.contains(Family::V4, p),
            a.contains(Family::V4, p) || b.contains(Family::V4, p)
        );
        assert_eq!(
            intersect.contains(Family::V4, p),
            a.contains(Family::V4, p) && b.contains(Family::V4, p)
        );
        assert_eq!(
            subtract.contains(Family::V4, p),
            a.contains(Family::V4, p) && !b.contains(Family::V4, p)
        );
    }

    let mut self_union = a.copy();
    self_union.union(&a).unwrap();
    self_union.clean();
    let mut a_clean = a.copy();
    a_clean.clean();
    assert_eq!(self_union.blocks().unwrap(), a_clean.blocks().unwrap());

    let mut self_subtract = a.copy();
    self_subtract.subtract(&a).unwrap();
    assert!(self_subtract.is_empty());
}

#[test]
fn bag_sorted_iteration_is_strictly_increasing() {
    let mut bag = Bag::create_untyped(4);
    for key in [50u128, 3, 900, 12, 1] {
        bag.add(key, 1).unwrap();
    }

    let mut it = bag.iterator_create_sorted();
    let mut prev: Option<u128> = None;
    let mut count = 0;
    while let Some((key, _value)) = it.next(&bag).unwrap() {
        if let Some(p) = prev {
            assert!(key > p, "iterator must be strictly increasing");
        }
        prev = Some(key);
        count += 1;
    }
    assert_eq!(count, 5);
}
