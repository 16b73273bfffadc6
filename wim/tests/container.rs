//! End-to-end container scenarios: create, write, reopen, append, export,
//! split/join, solid resources, integrity checking.

use std::fs;
use std::path::PathBuf;

use rand::{rngs::StdRng, RngCore, SeedableRng};
use wim::{
    join, CompressionType, ErrorKind, ExportFlags, Images, MemTreeSource, OpenFlags,
    ProgressAction, Sha1Hash, StreamRef, Wim, WriteFlags,
};

fn tmp(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    (dir, path)
}

fn source_from(files: &[(&str, &[u8])]) -> MemTreeSource {
    let mut src = MemTreeSource::new();
    for (path, data) in files {
        src.add_file(*path, data.to_vec());
    }
    src
}

fn unnamed_hash(w: &Wim, image: u32, path: &str) -> Sha1Hash {
    match w.image(image).unwrap().lookup(path).unwrap().unnamed_stream {
        StreamRef::Hash(h) => h,
        other => panic!("expected a hashed stream at {path}, got {other:?}"),
    }
}

#[test]
fn create_write_reopen_roundtrip() {
    let (_dir, path) = tmp("x.wim");

    let mut w = Wim::create(CompressionType::Lzx).unwrap();
    let mut src = source_from(&[("readme.txt", b"hello\n")]);
    assert_eq!(w.add_image(&mut src, "A").unwrap(), 1);
    w.write(&path, Images::All, WriteFlags::default(), 1).unwrap();

    let mut r = Wim::open(&path, OpenFlags::default()).unwrap();
    assert_eq!(r.image_count(), 1);
    assert_eq!(r.image_name(1).unwrap(), "A");
    assert_eq!(r.compression_type(), CompressionType::Lzx);

    let mut names = Vec::new();
    r.iterate_dir_tree(1, "/", true, &mut |e| {
        names.push(e.path.clone());
        ProgressAction::Continue
    })
    .unwrap();
    assert_eq!(names, vec!["/".to_string(), "/readme.txt".to_string()]);

    let hash = unnamed_hash(&r, 1, "/readme.txt");
    assert_eq!(hash, Sha1Hash::of(b"hello\n"));
    assert_eq!(r.blob_size(&hash).unwrap(), 6);
    assert_eq!(r.read_blob(&hash).unwrap(), b"hello\n");
}

#[test]
fn export_with_recompression() {
    let (_dir, path) = tmp("x.wim");
    let (_dir2, path2) = tmp("y.wim");

    let mut w = Wim::create(CompressionType::Lzx).unwrap();
    let payload: Vec<u8> = b"compress me "
        .iter()
        .copied()
        .cycle()
        .take(100_000)
        .collect();
    let mut src = source_from(&[("readme.txt", b"hello\n"), ("big.bin", &payload)]);
    w.add_image(&mut src, "A").unwrap();
    w.write(&path, Images::All, WriteFlags::default(), 1).unwrap();

    let mut src_wim = Wim::open(&path, OpenFlags::default()).unwrap();
    let mut dst = Wim::create(CompressionType::Xpress).unwrap();
    src_wim
        .export_image(Images::One(1), &mut dst, None, None, ExportFlags::default())
        .unwrap();
    dst.write(&path2, Images::All, WriteFlags::default().recompress(), 1)
        .unwrap();

    let mut r = Wim::open(&path2, OpenFlags::default()).unwrap();
    assert_eq!(r.image_count(), 1);
    assert_eq!(r.compression_type(), CompressionType::Xpress);
    let hash = unnamed_hash(&r, 1, "/readme.txt");
    assert_eq!(hash, Sha1Hash::of(b"hello\n"));
    assert_eq!(r.read_blob(&hash).unwrap(), b"hello\n");
    let big = unnamed_hash(&r, 1, "/big.bin");
    assert_eq!(r.read_blob(&big).unwrap(), payload);
}

#[test]
fn export_is_idempotent_on_blob_set() {
    let (_dir, path) = tmp("x.wim");
    let mut w = Wim::create(CompressionType::Xpress).unwrap();
    let mut src = source_from(&[("a.txt", b"alpha"), ("b.txt", b"beta")]);
    w.add_image(&mut src, "A").unwrap();
    w.write(&path, Images::All, WriteFlags::default(), 1).unwrap();

    let mut src_wim = Wim::open(&path, OpenFlags::default()).unwrap();
    let mut dst = Wim::create(CompressionType::Xpress).unwrap();
    src_wim
        .export_image(Images::One(1), &mut dst, Some("one"), None, ExportFlags::default())
        .unwrap();
    let blobs_after_first: Vec<Sha1Hash> = dst.blob_hashes();
    src_wim
        .export_image(Images::One(1), &mut dst, Some("two"), None, ExportFlags::default())
        .unwrap();
    let blobs_after_second: Vec<Sha1Hash> = dst.blob_hashes();
    assert_eq!(blobs_after_first, blobs_after_second);
    assert_eq!(dst.image_count(), 2);
}

#[test]
fn append_in_place_dedups() {
    let (_dir, path) = tmp("x.wim");

    let mut w = Wim::create(CompressionType::Lzx).unwrap();
    let mut src = source_from(&[("readme.txt", b"hello\n")]);
    w.add_image(&mut src, "A").unwrap();
    w.write(&path, Images::All, WriteFlags::default(), 1).unwrap();
    let size_before = fs::metadata(&path).unwrap().len();

    let mut w = Wim::open(&path, OpenFlags::default().write_access()).unwrap();
    let mut src = source_from(&[("readme.txt", b"hello\n"), ("notes.txt", b"hi\n")]);
    w.add_image(&mut src, "B").unwrap();
    w.overwrite(WriteFlags::default(), 1).unwrap();

    let size_after = fs::metadata(&path).unwrap().len();
    assert!(size_after > size_before);

    let mut r = Wim::open(&path, OpenFlags::default()).unwrap();
    assert_eq!(r.image_count(), 2);
    // Deduplicated pool: exactly two distinct blobs.
    assert_eq!(r.blob_hashes().len(), 2);
    assert_eq!(
        unnamed_hash(&r, 1, "/readme.txt"),
        unnamed_hash(&r, 2, "/readme.txt")
    );
    assert_eq!(r.read_blob(&Sha1Hash::of(b"hi\n")).unwrap(), b"hi\n");
    assert_eq!(r.read_blob(&Sha1Hash::of(b"hello\n")).unwrap(), b"hello\n");
}

#[test]
fn overwrite_without_changes_is_noop() {
    let (_dir, path) = tmp("x.wim");
    let mut w = Wim::create(CompressionType::Xpress).unwrap();
    let mut src = source_from(&[("f.txt", b"data here")]);
    w.add_image(&mut src, "A").unwrap();
    w.write(&path, Images::All, WriteFlags::default(), 1).unwrap();

    let before = fs::read(&path).unwrap();
    let mut w = Wim::open(&path, OpenFlags::default().write_access()).unwrap();
    w.overwrite(WriteFlags::default(), 1).unwrap();
    let after = fs::read(&path).unwrap();
    assert_eq!(before, after);
}

#[test]
fn empty_container_and_empty_file() {
    let (_dir, path) = tmp("empty.wim");
    let mut w = Wim::create(CompressionType::None).unwrap();
    w.write(&path, Images::All, WriteFlags::default(), 1).unwrap();
    let r = Wim::open(&path, OpenFlags::default()).unwrap();
    assert_eq!(r.image_count(), 0);

    // One image holding a single empty file: the stream hash is the
    // all-zero digest and no blob is allocated.
    let (_dir2, path2) = tmp("one.wim");
    let mut w = Wim::create(CompressionType::None).unwrap();
    let mut src = source_from(&[("empty.dat", b"")]);
    w.add_image(&mut src, "A").unwrap();
    w.write(&path2, Images::All, WriteFlags::default(), 1).unwrap();

    let mut r = Wim::open(&path2, OpenFlags::default()).unwrap();
    assert_eq!(r.blob_hashes().len(), 0);
    let entry = r.image(1).unwrap().lookup("/empty.dat").unwrap();
    assert_eq!(entry.unnamed_stream, StreamRef::Empty);

    let out = tempfile::tempdir().unwrap();
    r.extract_image(1, out.path()).unwrap();
    assert_eq!(fs::read(out.path().join("empty.dat")).unwrap(), b"");
}

#[test]
fn extract_image_reproduces_tree() {
    let (_dir, path) = tmp("x.wim");
    let mut payload = vec![0u8; 150_000];
    StdRng::seed_from_u64(7).fill_bytes(&mut payload);

    let mut w = Wim::create(CompressionType::Lzx).unwrap();
    let mut src = source_from(&[
        ("docs/readme.txt", b"hello\n"),
        ("docs/sub/deep.bin", &payload),
        ("top.txt", b"top level"),
    ]);
    w.add_image(&mut src, "A").unwrap();
    w.write(&path, Images::All, WriteFlags::default(), 2).unwrap();

    let mut r = Wim::open(&path, OpenFlags::default()).unwrap();
    let out = tempfile::tempdir().unwrap();
    r.extract_image(1, out.path()).unwrap();
    assert_eq!(fs::read(out.path().join("docs/readme.txt")).unwrap(), b"hello\n");
    assert_eq!(fs::read(out.path().join("docs/sub/deep.bin")).unwrap(), payload);
    assert_eq!(fs::read(out.path().join("top.txt")).unwrap(), b"top level");
}

#[test]
fn split_and_join() {
    let (_dir, path) = tmp("x.wim");

    // Incompressible blobs so the parts really fill up.
    let mut rng = StdRng::seed_from_u64(42);
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    for i in 0..6 {
        let mut data = vec![0u8; 3000];
        rng.fill_bytes(&mut data);
        files.push((format!("f{i}.bin"), data));
    }

    let mut w = Wim::create(CompressionType::Xpress).unwrap();
    let mut src = MemTreeSource::new();
    for (name, data) in &files {
        src.add_file(name.clone(), data.clone());
    }
    w.add_image(&mut src, "A").unwrap();
    w.write(&path, Images::All, WriteFlags::default(), 1).unwrap();

    let swm = path.with_extension("swm");
    let mut w = Wim::open(&path, OpenFlags::default()).unwrap();
    w.split(&swm, 4096, WriteFlags::default()).unwrap();

    // Enumerate the produced parts.
    let mut parts = vec![swm.clone()];
    for n in 2.. {
        let p = swm.with_file_name(format!("x{n}.swm"));
        if !p.exists() {
            break;
        }
        parts.push(p);
    }
    assert!(parts.len() >= 2, "expected at least 2 parts");

    // Parts share the GUID and are marked spanned; a lone part cannot be
    // opened without split_ok.
    let part1 = Wim::open(&parts[0], OpenFlags::default().split_ok()).unwrap();
    let part2 = Wim::open(&parts[1], OpenFlags::default().split_ok()).unwrap();
    assert_eq!(part1.guid(), part2.guid());
    let err = Wim::open(&parts[1], OpenFlags::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SplitUnsupported);
    drop(part1);
    drop(part2);

    let joined_path = path.with_extension("joined.wim");
    join(&parts, &joined_path, OpenFlags::default(), WriteFlags::default()).unwrap();

    let mut j = Wim::open(&joined_path, OpenFlags::default()).unwrap();
    assert_eq!(j.image_count(), 1);
    for (name, data) in &files {
        let hash = unnamed_hash(&j, 1, &format!("/{name}"));
        assert_eq!(hash, Sha1Hash::of(data));
        assert_eq!(&j.read_blob(&hash).unwrap(), data);
    }
}

#[test]
fn split_part_size_smaller_than_largest_blob() {
    let (_dir, path) = tmp("x.wim");
    let mut rng = StdRng::seed_from_u64(9);
    let mut big = vec![0u8; 20_000];
    rng.fill_bytes(&mut big);

    let mut w = Wim::create(CompressionType::None).unwrap();
    let mut src = MemTreeSource::new();
    src.add_file("big.bin", big.clone());
    src.add_file("small.bin", b"tiny".to_vec());
    w.add_image(&mut src, "A").unwrap();
    w.write(&path, Images::All, WriteFlags::default(), 1).unwrap();

    let swm = path.with_extension("swm");
    let mut w = Wim::open(&path, OpenFlags::default()).unwrap();
    // Soft limit: the 20k blob still goes into one part whole.
    w.split(&swm, 4096, WriteFlags::default()).unwrap();

    let mut parts = vec![swm.clone()];
    for n in 2.. {
        let p = swm.with_file_name(format!("x{n}.swm"));
        if !p.exists() {
            break;
        }
        parts.push(p);
    }

    let joined = path.with_extension("joined.wim");
    join(&parts, &joined, OpenFlags::default(), WriteFlags::default()).unwrap();
    let mut j = Wim::open(&joined, OpenFlags::default()).unwrap();
    assert_eq!(j.read_blob(&Sha1Hash::of(&big)).unwrap(), big);
}

#[test]
fn solid_lzms_blobs_rehash() {
    let (_dir, path) = tmp("solid.wim");

    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    for i in 0..5u32 {
        let data: Vec<u8> = format!("solid payload {i} ")
            .into_bytes()
            .iter()
            .copied()
            .cycle()
            .take(30_000 + i as usize * 1000)
            .collect();
        files.push((format!("s{i}.dat"), data));
    }

    let mut w = Wim::create(CompressionType::Lzx).unwrap();
    let mut src = MemTreeSource::new();
    for (name, data) in &files {
        src.add_file(name.clone(), data.clone());
    }
    w.add_image(&mut src, "A").unwrap();
    w.write(&path, Images::All, WriteFlags::default().solid(), 1)
        .unwrap();

    // Every blob recovered from the solid resource hashes back to its
    // blob table identity (read_blob verifies internally, too).
    let mut r = Wim::open(&path, OpenFlags::default()).unwrap();
    assert_eq!(r.image_count(), 1);
    for (name, data) in &files {
        let hash = unnamed_hash(&r, 1, &format!("/{name}"));
        assert_eq!(hash, Sha1Hash::of(data));
        let recovered = r.read_blob(&hash).unwrap();
        assert_eq!(&recovered, data);
        assert_eq!(Sha1Hash::of(&recovered), hash);
    }
}

#[test]
fn integrity_detects_corruption() {
    let (_dir, path) = tmp("chk.wim");
    // Incompressible, so the first resource is large and byte 2000 falls
    // inside its chunk data.
    let mut payload = vec![0u8; 200_000];
    StdRng::seed_from_u64(0xC0).fill_bytes(&mut payload);

    let mut w = Wim::create(CompressionType::Lzx).unwrap();
    let mut src = source_from(&[("data.bin", &payload)]);
    w.add_image(&mut src, "A").unwrap();
    w.write(
        &path,
        Images::All,
        WriteFlags::default().check_integrity(),
        1,
    )
    .unwrap();

    // Pristine file verifies.
    let _ = Wim::open(&path, OpenFlags::default().check_integrity()).unwrap();

    // Flip one byte in the middle of the blob area (the first resource
    // starts right after the 208-byte header).
    let mut bytes = fs::read(&path).unwrap();
    bytes[2000] ^= 0x40;
    fs::write(&path, &bytes).unwrap();

    let err = Wim::open(&path, OpenFlags::default().check_integrity()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);

    // Without the flag the open succeeds, but reading the damaged blob
    // fails its own verification.
    let mut r = Wim::open(&path, OpenFlags::default()).unwrap();
    let hash = unnamed_hash(&r, 1, "/data.bin");
    let err = r.read_blob(&hash).unwrap_err();
    assert!(
        matches!(
            err.kind(),
            ErrorKind::Decompression | ErrorKind::InvalidResourceHash
        ),
        "unexpected error kind {:?}",
        err.kind()
    );
}

#[test]
fn pipable_write_and_reopen() {
    let (_dir, path) = tmp("pipe.wim");
    let payload: Vec<u8> = b"pipable content "
        .iter()
        .copied()
        .cycle()
        .take(90_000)
        .collect();

    let mut w = Wim::create(CompressionType::Xpress).unwrap();
    let mut src = source_from(&[("p.bin", &payload), ("q.txt", b"q")]);
    w.add_image(&mut src, "P").unwrap();

    let file = fs::File::create(&path).unwrap();
    w.write_to_fd(file, Images::All, WriteFlags::default().pipable(), 1)
        .unwrap();

    let mut r = Wim::open(&path, OpenFlags::default()).unwrap();
    assert!(r.is_pipable());
    assert_eq!(r.image_count(), 1);
    let hash = unnamed_hash(&r, 1, "/p.bin");
    assert_eq!(r.read_blob(&hash).unwrap(), payload);
}

#[test]
fn delete_image_forces_rebuild() {
    let (_dir, path) = tmp("del.wim");
    let mut w = Wim::create(CompressionType::Xpress).unwrap();
    let mut src = source_from(&[("a.bin", b"aaaa data")]);
    w.add_image(&mut src, "A").unwrap();
    let mut src = source_from(&[("b.bin", b"bbbb data")]);
    w.add_image(&mut src, "B").unwrap();
    w.write(&path, Images::All, WriteFlags::default(), 1).unwrap();

    let mut w = Wim::open(&path, OpenFlags::default().write_access()).unwrap();
    w.delete_image(1).unwrap();
    w.overwrite(WriteFlags::default(), 1).unwrap();

    let mut r = Wim::open(&path, OpenFlags::default()).unwrap();
    assert_eq!(r.image_count(), 1);
    assert_eq!(r.image_name(1).unwrap(), "B");
    let hash = unnamed_hash(&r, 1, "/b.bin");
    assert_eq!(r.read_blob(&hash).unwrap(), b"bbbb data");
    // The rebuild dropped image A's now-unreferenced blob.
    assert_eq!(r.blob_hashes().len(), 1);
}

#[test]
fn unsafe_compact_reclaims_space() {
    let (_dir, path) = tmp("compact.wim");
    let mut rng = StdRng::seed_from_u64(3);
    let mut a = vec![0u8; 60_000];
    let mut b = vec![0u8; 50_000];
    rng.fill_bytes(&mut a);
    rng.fill_bytes(&mut b);

    let mut w = Wim::create(CompressionType::None).unwrap();
    let mut src = MemTreeSource::new();
    src.add_file("a.bin", a.clone());
    w.add_image(&mut src, "A").unwrap();
    let mut src = MemTreeSource::new();
    src.add_file("b.bin", b.clone());
    w.add_image(&mut src, "B").unwrap();
    w.write(&path, Images::All, WriteFlags::default(), 1).unwrap();
    let full_size = fs::metadata(&path).unwrap().len();

    let mut w = Wim::open(&path, OpenFlags::default().write_access()).unwrap();
    w.delete_image(1).unwrap();
    w.overwrite(WriteFlags::default().unsafe_compact(), 1).unwrap();
    let compact_size = fs::metadata(&path).unwrap().len();
    assert!(compact_size <= full_size);

    let mut r = Wim::open(&path, OpenFlags::default()).unwrap();
    assert_eq!(r.image_count(), 1);
    assert_eq!(r.read_blob(&Sha1Hash::of(&b)).unwrap(), b);
}

#[test]
fn write_reopen_compare_trees_all_compression_types() {
    for ctype in [
        CompressionType::None,
        CompressionType::Xpress,
        CompressionType::Lzx,
        CompressionType::Lzms,
    ] {
        let (_dir, path) = tmp("t.wim");
        let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 200) as u8).collect();
        let mut w = Wim::create(ctype).unwrap();
        let mut src = source_from(&[("x/deep/file.bin", &payload), ("y.txt", b"y content")]);
        w.add_image(&mut src, "img").unwrap();
        w.write(&path, Images::All, WriteFlags::default(), 2).unwrap();

        let mut r = Wim::open(&path, OpenFlags::default()).unwrap();
        assert_eq!(r.compression_type(), ctype, "{ctype:?}");
        let hash = unnamed_hash(&r, 1, "/x/deep/file.bin");
        assert_eq!(r.read_blob(&hash).unwrap(), payload, "{ctype:?}");
        assert_eq!(
            r.read_blob(&Sha1Hash::of(b"y content")).unwrap(),
            b"y content",
            "{ctype:?}"
        );
    }
}

#[test]
fn subset_write_remaps_boot_index() {
    let (_dir, path) = tmp("subset.wim");
    let (_dir2, sub_path) = tmp("sub.wim");

    let mut w = Wim::create(CompressionType::Xpress).unwrap();
    let mut src = source_from(&[("a.txt", b"one")]);
    w.add_image(&mut src, "one").unwrap();
    let mut src = source_from(&[("b.txt", b"two")]);
    w.add_image(&mut src, "two").unwrap();
    w.set_boot_index(2).unwrap();
    w.write(&path, Images::All, WriteFlags::default(), 1).unwrap();

    let mut w = Wim::open(&path, OpenFlags::default()).unwrap();
    assert_eq!(w.boot_index(), 2);
    w.write(&sub_path, Images::One(2), WriteFlags::default(), 1)
        .unwrap();

    let r = Wim::open(&sub_path, OpenFlags::default()).unwrap();
    assert_eq!(r.image_count(), 1);
    assert_eq!(r.image_name(1).unwrap(), "two");
    assert_eq!(r.boot_index(), 1);
}

#[test]
fn progress_abort_cancels_write() {
    let (_dir, path) = tmp("abort.wim");
    let payload: Vec<u8> = vec![7u8; 400_000];
    let mut w = Wim::create(CompressionType::Xpress).unwrap();
    let mut src = source_from(&[("big.bin", &payload)]);
    w.add_image(&mut src, "A").unwrap();
    w.set_progress(Box::new(|info| {
        if matches!(info, wim::Progress::WriteStreams { .. }) {
            ProgressAction::Abort
        } else {
            ProgressAction::Continue
        }
    }));
    let err = w
        .write(&path, Images::All, WriteFlags::default(), 1)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AbortedByProgress);
}

