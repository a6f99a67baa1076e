//! Whole-filesystem integration tests driven entirely through the public
//! `flashfs` API: format, mount, create/write/sync, remount, power-loss
//! prefix truncation. Exercises the on-disk format end to end rather than
//! any one module in isolation.

use flashfs::{Error, FaultInjectingDevice, Filesystem, FormatOptions, Geometry, MountOptions, OpenFlags, RamDevice};

fn geom() -> Geometry {
    Geometry {
        read_size: 16,
        prog_size: 16,
        block_size: 256,
        block_count: 128,
    }
}

fn format_opts() -> FormatOptions {
    FormatOptions::new(256, 128).inline_size(16).fragment_size(8)
}

#[test]
fn fresh_format_then_mount_is_an_empty_root() {
    let fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
    let device = fs.unmount().unwrap();

    let mut fs = Filesystem::mount(device, &MountOptions::new()).unwrap();
    assert!(fs.read_dir("/").unwrap().is_empty());
}

#[test]
fn small_file_round_trips_through_a_remount() {
    let fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
    let device = fs.unmount().unwrap();
    let mut fs = Filesystem::mount(device, &MountOptions::new()).unwrap();

    let mut handle = fs.create("/note.txt").unwrap();
    fs.write(&mut handle, b"small file").unwrap();
    fs.close(handle).unwrap();
    let device = fs.unmount().unwrap();

    let mut fs = Filesystem::mount(device, &MountOptions::new()).unwrap();
    let mut handle = fs.open("/note.txt", OpenFlags::read_only()).unwrap();
    let mut buf = [0u8; 10];
    fs.read(&mut handle, &mut buf).unwrap();
    assert_eq!(&buf, b"small file");
    fs.close(handle).unwrap();
}

#[test]
fn big_file_crystallizes_into_blocks_and_round_trips() {
    let fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
    let device = fs.unmount().unwrap();
    let mut fs = Filesystem::mount(device, &MountOptions::new()).unwrap();

    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let mut handle = fs.create("/big.bin").unwrap();
    fs.write(&mut handle, &payload).unwrap();
    fs.close(handle).unwrap();
    let device = fs.unmount().unwrap();

    let mut fs = Filesystem::mount(device, &MountOptions::new()).unwrap();
    let mut handle = fs.open("/big.bin", OpenFlags::read_only()).unwrap();
    assert_eq!(handle.size(), payload.len() as u64);
    let mut buf = vec![0u8; payload.len()];
    let mut read = 0;
    while read < buf.len() {
        let n = fs.read(&mut handle, &mut buf[read..]).unwrap();
        assert!(n > 0);
        read += n;
    }
    assert_eq!(buf, payload);
    fs.close(handle).unwrap();

    fs.ckmeta().unwrap();
    fs.ckdata().unwrap();
}

#[test]
fn nested_directories_list_and_remove_correctly() {
    let mut fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
    fs.mkdir("/a").unwrap();
    fs.mkdir("/a/b").unwrap();
    let mut handle = fs.create("/a/b/leaf.txt").unwrap();
    fs.write(&mut handle, b"leaf").unwrap();
    fs.close(handle).unwrap();

    let top = fs.read_dir("/").unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].name, b"a");

    let mid = fs.read_dir("/a").unwrap();
    assert_eq!(mid.len(), 1);
    assert_eq!(mid[0].name, b"b");

    let leaves = fs.read_dir("/a/b").unwrap();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].name, b"leaf.txt");

    assert!(matches!(fs.remove("/a"), Err(Error::NotEmpty)));
    fs.remove("/a/b/leaf.txt").unwrap();
    assert!(matches!(fs.remove("/a"), Err(Error::NotEmpty)));
    fs.remove("/a/b").unwrap();
    fs.remove("/a").unwrap();
    assert!(fs.read_dir("/").unwrap().is_empty());
}

#[test]
fn two_open_handles_one_removed_does_not_disturb_the_other() {
    let mut fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();

    let mut h1 = fs.create("/one.txt").unwrap();
    fs.write(&mut h1, b"one").unwrap();
    fs.close(h1).unwrap();

    let mut h2 = fs.create("/two.txt").unwrap();
    fs.write(&mut h2, b"two").unwrap();
    fs.close(h2).unwrap();

    fs.remove("/one.txt").unwrap();

    assert!(matches!(fs.stat("/one.txt"), Err(Error::NoEnt)));
    let mut handle = fs.open("/two.txt", OpenFlags::read_only()).unwrap();
    let mut buf = [0u8; 3];
    fs.read(&mut handle, &mut buf).unwrap();
    assert_eq!(&buf, b"two");
    fs.close(handle).unwrap();
}

#[test]
fn mkconsistent_is_idempotent_on_a_clean_filesystem() {
    let fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
    let device = fs.unmount().unwrap();
    let mut fs = Filesystem::mount(device, &MountOptions::new()).unwrap();

    let mut handle = fs.create("/a.txt").unwrap();
    fs.write(&mut handle, b"data").unwrap();
    fs.close(handle).unwrap();

    fs.mkconsistent().unwrap();
    fs.mkconsistent().unwrap();
}

#[test]
fn grow_promotes_out_of_2b_only_mode_and_survives_a_remount() {
    let fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
    let device = fs.unmount().unwrap();
    let mut fs = Filesystem::mount(device, &MountOptions::new()).unwrap();

    fs.grow().unwrap();
    let mut handle = fs.create("/after-grow.txt").unwrap();
    fs.write(&mut handle, b"payload").unwrap();
    fs.close(handle).unwrap();
    let device = fs.unmount().unwrap();

    let mut fs = Filesystem::mount(device, &MountOptions::new()).unwrap();
    let mut handle = fs.open("/after-grow.txt", OpenFlags::read_only()).unwrap();
    let mut buf = [0u8; 7];
    fs.read(&mut handle, &mut buf).unwrap();
    assert_eq!(&buf, b"payload");
    fs.close(handle).unwrap();
}

#[test]
fn usage_reports_nonzero_blocks_after_a_write() {
    let mut fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
    let before = fs.usage().unwrap().blocks_in_use;

    let mut handle = fs.create("/file.bin").unwrap();
    let payload = vec![7u8; 1500];
    fs.write(&mut handle, &payload).unwrap();
    fs.close(handle).unwrap();

    let after = fs.usage().unwrap().blocks_in_use;
    assert!(after > before);
}

/// An interrupted second write must never corrupt the content a prior,
/// already-closed sync left durable: cutting power partway through the
/// second commit's progs leaves the file reading back as its old
/// content, not a torn mix of old and new bytes.
#[test]
fn power_loss_mid_write_keeps_the_previous_sync_readable() {
    let fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
    let device = fs.unmount().unwrap();
    let mut fs = Filesystem::mount(device, &MountOptions::new()).unwrap();

    let mut handle = fs.create("/durable.txt").unwrap();
    fs.write(&mut handle, b"first").unwrap();
    fs.close(handle).unwrap();
    let device = fs.unmount().unwrap();

    let mut faulty = FaultInjectingDevice::new(device);
    faulty.power_loss_after(1);
    let mut fs = Filesystem::mount(faulty, &MountOptions::new()).unwrap();

    let mut handle = fs.open("/durable.txt", OpenFlags::read_write()).unwrap();
    fs.write(&mut handle, b"-second").unwrap();
    let _ = fs.close(handle);

    let faulty = fs.unmount().unwrap();
    let device = faulty.into_inner();

    let mut fs = Filesystem::mount(device, &MountOptions::new()).unwrap();
    let mut handle = fs.open("/durable.txt", OpenFlags::read_only()).unwrap();
    let mut buf = [0u8; 5];
    fs.read(&mut handle, &mut buf).unwrap();
    assert_eq!(&buf, b"first");
    fs.close(handle).unwrap();
}
