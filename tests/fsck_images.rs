// Corridas completas del fsck sobre imágenes formateadas con mkfs y
// corrompidas a mano.

use std::io::Write;

use ffsck::cg::{CgFormat, CylinderGroup};
use ffsck::dir::{dir_template, DirFormat};
use ffsck::fs::{Daddr, Ino, NDADDR, NIADDR, ROOTINO};
use ffsck::fsck::config::{AnswerMode, FsckOptions};
use ffsck::fsck::error::FsckError;
use ffsck::fsck::fsck_backend::FileDevice;
use ffsck::fsck::fsck_types::FsckReport;
use ffsck::fsck::mock::{MemDevice, TestImage};
use ffsck::fsck::prompt::{FixedOperator, PreenOperator, ScriptedOperator};
use ffsck::fsck::{lftempname, run_fsck, Fsck};
use ffsck::inode::{Dinode, IFDIR, IFREG};
use ffsck::mkfs::{MkfsParams, LOSTFOUNDINO};

fn run(dev: MemDevice, yes: bool) -> (FsckReport, MemDevice) {
    run_fsck(dev, FsckOptions::default(), Box::new(ScriptedOperator::new(yes))).unwrap()
}

/// Lo que dejó una corrida, revisado otra vez: no hay nada que corregir.
fn assert_rerun_clean(dev: MemDevice) {
    let (rep, dev) = run(MemDevice::new(dev.data), true);
    assert!(rep.errors.is_empty(), "{:?}", rep.errors);
    assert_eq!(dev.writes, 0);
    assert_eq!(rep.exit_code(), 0);
}

fn file(blk: Daddr, nlink: i16) -> Dinode {
    let mut db = [0; NDADDR];
    db[0] = blk;
    Dinode {
        mode: IFREG | 0o644,
        nlink,
        size: 300,
        blocks: 2,
        db,
        ..Dinode::default()
    }
}

#[test]
fn fresh_images_are_left_untouched() {
    for p in [MkfsParams::ufs2(), MkfsParams::ufs1_dynamic(), MkfsParams::ufs1_static()] {
        let t = TestImage::new(&p).unwrap();
        let (rep, dev) = run(t.device(), true);
        assert!(rep.errors.is_empty(), "{:?}: {:?}", p.version, rep.errors);
        assert!(rep.blocks_ok && rep.inodes_ok);
        assert_eq!(dev.writes, 0);
        assert!(!rep.modified);
        assert_eq!(rep.files, 2);
    }
}

#[test]
fn zero_link_file_is_cleared_once() {
    let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
    let blk = t.sb.cgdmin(0) + 24;
    t.put_inode(7, &file(blk, 0));

    let (rep, dev) = run(t.device(), true);
    assert!(rep.has_tag("UNREF FILE"));
    assert!(rep.modified);
    assert_eq!(rep.unresolved, 0);
    assert_rerun_clean(dev);
}

#[test]
fn shared_fragment_is_reported_for_both_owners() {
    let mut t = TestImage::new(&MkfsParams::ufs1_dynamic()).unwrap();
    let blk = t.sb.cgdmin(0) + 16;
    t.put_inode(5, &file(blk, 1));
    t.put_inode(9, &file(blk, 1));

    let (rep, dev) = run(t.device(), true);
    assert_eq!(rep.count_tag("DUP"), 2);
    assert!(rep.has_tag("BAD/DUP FILE"));
    assert_rerun_clean(dev);
}

#[test]
fn group_map_claiming_everything_free_is_rebuilt() {
    let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
    let at = t.sb.byte_offset(t.sb.cgtod(1)) as usize;
    let bsize = t.sb.bsize as usize;
    let buf = &mut t.img[at..at + bsize];
    let mut cg = CylinderGroup::decode(buf, &t.sb, CgFormat::Dynamic);
    cg.blksfree.fill(0xff);
    cg.encode(buf, true, CgFormat::Dynamic);

    let (rep, dev) = run(t.device(), true);
    assert!(rep.has_tag("BLK(S) MISSING IN BIT MAPS"));
    assert!(!rep.has_tag("FREE BLK COUNT(S) WRONG IN SUPERBLK"));
    assert_rerun_clean(dev);
}

#[test]
fn unreachable_directory_ends_up_in_lost_found() {
    let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
    let orphan: Ino = 10;
    let blk = t.sb.cgdmin(0) + 24;
    let fmt = DirFormat::for_fs(&t.sb, None);
    dir_template(t.frag_mut(blk), fmt, orphan, ROOTINO);
    let mut db = [0; NDADDR];
    db[0] = blk;
    t.put_inode(
        orphan,
        &Dinode {
            mode: IFDIR | 0o755,
            nlink: 2,
            size: t.sb.fsize as u64,
            blocks: 2,
            db,
            ..Dinode::default()
        },
    );

    let (rep, dev) = run(t.device(), true);
    assert!(rep.has_tag("UNREF DIR"));
    assert!(rep.has_tag("DIR CONNECTED"));
    assert_eq!(rep.unresolved, 0);

    let mut f = Fsck::new(
        MemDevice::new(dev.data.clone()),
        FsckOptions::default(),
        Box::new(ScriptedOperator::new(false)),
    );
    assert!(f.setup().unwrap());
    let name = lftempname(f.superblock().maxino(), orphan);
    assert_eq!(f.find_entry(LOSTFOUNDINO, name.as_bytes()).unwrap(), Some(orphan));
    assert_eq!(f.find_entry(orphan, b"..").unwrap(), Some(LOSTFOUNDINO));
    assert_eq!(f.ginode(LOSTFOUNDINO).unwrap().nlink, 3);
    assert_eq!(f.ginode(ROOTINO).unwrap().nlink, 3);

    assert_rerun_clean(dev);
}

#[test]
fn pointer_past_the_end_of_an_indirect_block_is_zeroed() {
    let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
    let frag = i64::from(t.sb.frag);
    let bsize = t.sb.bsize as u64;
    let base = (t.sb.cgdmin(1) + frag - 1) / frag * frag;
    let mut db = [0; NDADDR];
    for (i, d) in db.iter_mut().enumerate() {
        *d = base + frag * i as Daddr;
    }
    let ind = base + frag * NDADDR as Daddr;
    let last = ind + frag;
    let mut ib = [0; NIADDR];
    ib[0] = ind;
    let raw = t.frag_mut(ind);
    raw[..8].copy_from_slice(&last.to_le_bytes());
    // Índice 5: el archivo sólo usa la primera entrada.
    raw[40..48].copy_from_slice(&(last + 4 * frag).to_le_bytes());
    t.put_inode(
        7,
        &Dinode {
            mode: IFREG | 0o644,
            nlink: 1,
            size: bsize * (NDADDR as u64 + 1),
            blocks: (NDADDR as i64 + 2) * frag * 2,
            db,
            ib,
            ..Dinode::default()
        },
    );
    let at = t.sb.byte_offset(ind) as usize;

    let (rep, dev) = run(t.device(), true);
    assert_eq!(rep.count_tag("PARTIALLY TRUNCATED INODE"), 1);
    assert_eq!(rep.unresolved, 0);
    assert_eq!(&dev.data[at + 40..at + 48], &[0u8; 8]);
    assert_eq!(&dev.data[at..at + 8], &last.to_le_bytes());
    assert_rerun_clean(dev);
}

#[test]
fn declined_repairs_write_nothing() {
    let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
    t.put_inode(7, &file(t.sb.cgdmin(0) + 24, 1));
    let (rep, dev) = run(t.device(), false);
    assert!(rep.unresolved > 0);
    assert_eq!(rep.exit_code(), 8);
    assert_eq!(dev.writes, 0);
}

#[test]
fn preen_stops_on_a_missing_root() {
    let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
    t.put_inode(ROOTINO, &Dinode::default());
    let mut opts = FsckOptions::default();
    opts.mode = AnswerMode::Preen;
    opts.force = true;

    let err = run_fsck(t.device(), opts, Box::new(PreenOperator)).unwrap_err();
    assert!(matches!(err, FsckError::Unexpected(_)), "{err}");
    assert_eq!(err.exit_code(), 8);
}

#[test]
fn preen_skips_a_clean_filesystem() {
    let t = TestImage::new(&MkfsParams::ufs2()).unwrap();
    let mut opts = FsckOptions::default();
    opts.mode = AnswerMode::Preen;
    let (rep, dev) = run_fsck(t.device(), opts, Box::new(PreenOperator)).unwrap();
    assert!(rep.skipped);
    assert_eq!(dev.writes, 0);
}

#[test]
fn file_backed_device_is_repaired_in_place() {
    let mut t = TestImage::new(&MkfsParams::ufs1_static()).unwrap();
    t.put_inode(7, &file(t.sb.cgdmin(0) + 24, 0));
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&t.img).unwrap();
    tmp.flush().unwrap();

    // -n: solo lectura, nada cambia en el archivo.
    let mut opts = FsckOptions::default();
    opts.mode = AnswerMode::AssumeNo;
    let dev = FileDevice::open(tmp.path(), true).unwrap();
    let (rep, _) = run_fsck(dev, opts, Box::new(FixedOperator(false))).unwrap();
    assert!(rep.has_tag("UNREF FILE"));
    assert_eq!(rep.exit_code(), 8);
    assert_eq!(std::fs::read(tmp.path()).unwrap(), t.img);

    let dev = FileDevice::open(tmp.path(), false).unwrap();
    let (rep, _) = run_fsck(dev, FsckOptions::default(), Box::new(FixedOperator(true))).unwrap();
    assert!(rep.modified);
    assert_eq!(rep.exit_code(), 0);

    let repaired = std::fs::read(tmp.path()).unwrap();
    assert_ne!(repaired, t.img);
    assert_rerun_clean(MemDevice::new(repaired));
}

#[test]
fn conversion_to_dynamic_groups_sticks() {
    let t = TestImage::new(&MkfsParams::ufs1_static()).unwrap();
    let mut opts = FsckOptions::default();
    opts.convert = true;
    let (rep, dev) = run_fsck(t.device(), opts, Box::new(ScriptedOperator::new(true))).unwrap();
    assert!(rep.modified);
    assert_eq!(rep.unresolved, 0);
    assert_rerun_clean(dev);
}
