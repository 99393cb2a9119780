//! End-to-end behavior of a formatted volume: files, directories, paths,
//! growth, removal, and the buffer cache's write coalescing.

use std::collections::HashSet;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use tinyfs::{Dir, File, Filesys, FsError, Handle, MemDisk};

const DISK_SECTORS: u32 = 8192;

fn fresh() -> Filesys {
    let _ = env_logger::builder().is_test(true).try_init();
    Filesys::format(Arc::new(MemDisk::new(DISK_SECTORS))).unwrap()
}

fn open_file(fs: &Filesys, path: &str) -> File {
    match fs.open(path, None).unwrap() {
        Handle::File(file) => file,
        Handle::Dir(_) => panic!("{} opened as a directory", path),
    }
}

fn open_dir(fs: &Filesys, path: &str) -> Dir {
    match fs.open(path, None).unwrap() {
        Handle::Dir(dir) => dir,
        Handle::File(_) => panic!("{} opened as a file", path),
    }
}

fn names_of(fs: &Filesys, dir: &mut Dir) -> Vec<String> {
    let mut names = Vec::new();
    dir.rewind();
    while let Some(name) = dir.readdir(fs) {
        names.push(name);
    }
    names
}

#[test]
fn seek_then_read_tail() {
    let fs = fresh();
    fs.create("test.txt", None, 12).unwrap();

    let mut file = open_file(&fs, "test.txt");
    assert_eq!(file.write(&fs, b"hello world\0"), 12);
    file.seek(6);
    let mut buf = [0u8; 6];
    assert_eq!(file.read(&fs, &mut buf), 6);
    assert_eq!(&buf, b"world\0");
    fs.close(Handle::File(file));
}

#[test]
fn removed_file_usable_until_close() {
    let fs = fresh();
    let before = fs.used_sectors();

    fs.create("test.txt", None, 100).unwrap();
    let mut file = open_file(&fs, "test.txt");
    fs.remove("test.txt", None).unwrap();

    // The open handle keeps working on the unlinked file.
    assert_eq!(file.write(&fs, b"hello\0"), 6);
    file.seek(0);
    let mut buf = [0u8; 6];
    assert_eq!(file.read(&fs, &mut buf), 6);
    assert_eq!(&buf, b"hello\0");

    assert_eq!(fs.open("test.txt", None).unwrap_err(), FsError::NotFound);

    // The last close reclaims everything, directory entry included.
    fs.close(Handle::File(file));
    assert_eq!(fs.open("test.txt", None).unwrap_err(), FsError::NotFound);
    assert_eq!(fs.used_sectors(), before);
}

#[test]
fn byte_at_a_time_writes_coalesce() {
    const LEN: usize = 65536;
    let fs = fresh();
    fs.create("seq.dat", None, 0).unwrap();
    fs.flush();
    let baseline = fs.device_write_count();

    let mut file = open_file(&fs, "seq.dat");
    for i in 0..LEN {
        let byte = [(i % 251) as u8];
        assert_eq!(file.write(&fs, &byte), 1);
    }
    fs.flush();

    for i in 0..LEN {
        file.seek(i as u32);
        let mut byte = [0u8];
        assert_eq!(file.read(&fs, &mut byte), 1);
        assert_eq!(byte[0], (i % 251) as u8, "byte {}", i);
    }
    fs.close(Handle::File(file));

    let writes = fs.device_write_count() - baseline;
    // 128 data sectors, plus a bounded number of metadata writes.
    assert!(writes >= 128, "only {} device writes", writes);
    assert!(writes <= 160, "{} device writes, expected at most 160", writes);
}

#[test]
fn rereading_improves_hit_rate() {
    const LEN: u32 = 10240;
    let fs = fresh();
    fs.create("warm.dat", None, LEN).unwrap();
    fs.cache_reset();

    let mut chunk = [0u8; 256];
    let mut file = open_file(&fs, "warm.dat");
    let mut total = 0;
    while total < LEN {
        assert_eq!(file.read(&fs, &mut chunk), 256);
        total += 256;
    }
    let cold_rate = fs.cache_hit_rate();
    fs.close(Handle::File(file));

    let mut file = open_file(&fs, "warm.dat");
    let mut total = 0;
    while total < LEN {
        assert_eq!(file.read(&fs, &mut chunk), 256);
        total += 256;
    }
    let warm_rate = fs.cache_hit_rate();
    fs.close(Handle::File(file));

    assert!(
        warm_rate > cold_rate,
        "hit rate did not improve: {} -> {}",
        cold_rate,
        warm_rate
    );
    assert!(fs.cache_hit_count() <= fs.cache_access_count());
}

#[test]
fn far_write_extends_and_zero_fills() {
    const HOLE: usize = 65000;
    let fs = fresh();
    fs.create("sparse.dat", None, 0).unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut payload = [0u8; 1024];
    rng.fill(&mut payload[..]);

    let mut file = open_file(&fs, "sparse.dat");
    file.seek(HOLE as u32);
    assert_eq!(file.write(&fs, &payload), 1024);
    assert_eq!(file.len(&fs), (HOLE + 1024) as u32);

    file.seek(0);
    let mut hole = vec![0xffu8; HOLE];
    assert_eq!(file.read(&fs, &mut hole), HOLE);
    assert!(hole.iter().all(|&b| b == 0), "hole bytes must read as zero");

    let mut tail = [0u8; 1024];
    assert_eq!(file.read(&fs, &mut tail), 1024);
    assert_eq!(tail, payload);

    // The cursor sits at end of file now.
    assert_eq!(file.read(&fs, &mut tail), 0);
    fs.close(Handle::File(file));
}

#[test]
fn directory_removal_requires_empty() {
    let fs = fresh();
    fs.mkdir("/a", None).unwrap();
    fs.create("/a/f", None, 0).unwrap();

    assert_eq!(fs.remove("/a", None).unwrap_err(), FsError::NotEmpty);
    fs.remove("/a/f", None).unwrap();
    fs.remove("/a", None).unwrap();
    assert_eq!(fs.open("/a", None).unwrap_err(), FsError::NotFound);
}

#[test]
fn write_read_round_trip() {
    let fs = fresh();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut payload = vec![0u8; 3 * 512 + 137];
    rng.fill(&mut payload[..]);

    fs.create("blob", None, 0).unwrap();
    let mut file = open_file(&fs, "blob");
    assert_eq!(file.write(&fs, &payload), payload.len());
    file.seek(0);
    let mut back = vec![0u8; payload.len()];
    assert_eq!(file.read(&fs, &mut back), payload.len());
    assert_eq!(back, payload);
    fs.close(Handle::File(file));
}

#[test]
fn fresh_directory_holds_only_dots() {
    let fs = fresh();
    fs.mkdir("/p", None).unwrap();

    let mut dir = open_dir(&fs, "/p");
    assert!(dir.inode().is_dir(&fs));
    let names = names_of(&fs, &mut dir);
    assert_eq!(names, vec![".".to_string(), "..".to_string()]);
    fs.close(Handle::Dir(dir));
}

#[test]
fn readdir_lists_each_entry_once() {
    let fs = fresh();
    fs.mkdir("/many", None).unwrap();
    let expected: HashSet<String> = (0..40).map(|i| format!("f{:02}", i)).collect();
    for name in &expected {
        fs.create(&format!("/many/{}", name), None, 0).unwrap();
    }

    let mut dir = open_dir(&fs, "/many");
    let listed: Vec<String> = names_of(&fs, &mut dir)
        .into_iter()
        .filter(|n| n != "." && n != "..")
        .collect();
    assert_eq!(listed.len(), expected.len(), "duplicates or omissions");
    assert_eq!(listed.into_iter().collect::<HashSet<_>>(), expected);
    fs.close(Handle::Dir(dir));
}

#[test]
fn grow_then_remove_returns_sectors() {
    let fs = fresh();
    let before = fs.used_sectors();

    fs.create("grow", None, 0).unwrap();
    let mut file = open_file(&fs, "grow");
    // Deep enough to need the doubly-indirect tier.
    let payload = vec![0xabu8; 200_000];
    assert_eq!(file.write(&fs, &payload), payload.len());
    assert!(fs.used_sectors() > before + 391);

    fs.remove("grow", None).unwrap();
    fs.close(Handle::File(file));
    assert_eq!(fs.used_sectors(), before);
}

#[test]
fn slot_reuse_keeps_directories_compact() {
    let fs = fresh();
    for name in ["a", "b", "c"].iter().copied() {
        fs.create(name, None, 0).unwrap();
    }
    let len_before = {
        let root = fs.root_dir();
        let len = root.inode().len(&fs);
        fs.close(Handle::Dir(root));
        len
    };

    fs.remove("b", None).unwrap();
    fs.create("d", None, 0).unwrap();

    let root = fs.root_dir();
    assert_eq!(root.inode().len(&fs), len_before, "freed slot was not reused");
    fs.close(Handle::Dir(root));
}

#[test]
fn deny_write_blocks_other_handles() {
    let fs = fresh();
    fs.create("text", None, 16).unwrap();

    let mut guard = open_file(&fs, "text");
    let mut other = open_file(&fs, "text");
    guard.deny_write();

    assert_eq!(other.write(&fs, b"nope"), 0);
    guard.allow_write();
    assert_eq!(other.write(&fs, b"yes!"), 4);

    // Closing a denying handle lifts the denial too.
    guard.deny_write();
    fs.close(Handle::File(guard));
    assert_eq!(other.write(&fs, b"more"), 4);
    fs.close(Handle::File(other));
}

#[test]
fn opens_of_one_file_share_the_inode() {
    let fs = fresh();
    fs.create("shared", None, 0).unwrap();

    let a = fs.open("shared", None).unwrap();
    let b = fs.open("shared", None).unwrap();
    assert!(Arc::ptr_eq(a.inode(), b.inode()));
    assert_eq!(a.inode().open_count(), 2);

    let c = fs.reopen(&a);
    assert_eq!(a.inode().open_count(), 3);
    fs.close(c);
    fs.close(b);
    assert_eq!(a.inode().open_count(), 1);
    fs.close(a);
}

#[test]
fn paths_resolve_dots_and_extra_slashes() {
    let fs = fresh();
    fs.mkdir("/u", None).unwrap();
    fs.mkdir("/u/docs", None).unwrap();
    fs.create("/u/docs/note", None, 0).unwrap();

    fs.close(fs.open("//u///docs//note/", None).unwrap());
    fs.close(fs.open("/u/docs/../docs/./note", None).unwrap());
    fs.close(fs.open("/u/..", None).unwrap());

    let mut cwd = fs.root_dir();
    fs.chdir(&mut cwd, "/u/docs").unwrap();
    fs.close(fs.open("note", Some(&cwd)).unwrap());
    fs.close(fs.open("../docs/note", Some(&cwd)).unwrap());
    fs.create("sibling", Some(&cwd), 0).unwrap();
    fs.close(fs.open("/u/docs/sibling", None).unwrap());
    fs.close(Handle::Dir(cwd));
}

#[test]
fn root_opens_as_directory() {
    let fs = fresh();
    let root = fs.open("/", None).unwrap();
    assert!(root.is_dir());
    fs.close(root);
}

#[test]
fn path_error_cases() {
    let fs = fresh();
    fs.create("plain", None, 0).unwrap();
    fs.mkdir("/d", None).unwrap();

    assert_eq!(fs.open("", None).unwrap_err(), FsError::InvalidPath);
    assert_eq!(fs.open("missing", None).unwrap_err(), FsError::NotFound);
    assert_eq!(fs.open("/no/such", None).unwrap_err(), FsError::NotFound);
    assert_eq!(
        fs.open("/plain/x", None).unwrap_err(),
        FsError::NotDirectory
    );
    assert_eq!(
        fs.create("a-very-long-name", None, 0).unwrap_err(),
        FsError::NameTooLong
    );
    assert_eq!(fs.create("plain", None, 0).unwrap_err(), FsError::Exists);
    assert_eq!(fs.mkdir("/d", None).unwrap_err(), FsError::Exists);
    assert_eq!(fs.remove("/d/.", None).unwrap_err(), FsError::InvalidPath);
    assert_eq!(fs.remove("/d/..", None).unwrap_err(), FsError::InvalidPath);
    assert_eq!(fs.remove("/", None).unwrap_err(), FsError::InvalidPath);

    let mut cwd = fs.root_dir();
    assert_eq!(fs.chdir(&mut cwd, "plain").unwrap_err(), FsError::NotDirectory);
    fs.close(Handle::Dir(cwd));
}

#[test]
fn cwd_holds_directory_open() {
    let fs = fresh();
    fs.mkdir("/busy", None).unwrap();

    let mut cwd = fs.root_dir();
    fs.chdir(&mut cwd, "/busy").unwrap();
    assert_eq!(fs.remove("/busy", None).unwrap_err(), FsError::Busy);

    fs.chdir(&mut cwd, "/").unwrap();
    fs.remove("/busy", None).unwrap();
    fs.close(Handle::Dir(cwd));
}

#[test]
fn volume_survives_remount() {
    let _ = env_logger::builder().is_test(true).try_init();
    let disk = Arc::new(MemDisk::new(DISK_SECTORS));

    let used = {
        let fs = Filesys::format(Arc::clone(&disk) as Arc<dyn tinyfs::BlockDevice>).unwrap();
        fs.mkdir("/home", None).unwrap();
        fs.create("/home/keep", None, 0).unwrap();
        let mut file = open_file(&fs, "/home/keep");
        assert_eq!(file.write(&fs, b"persistent data"), 15);
        fs.close(Handle::File(file));
        fs.flush();
        fs.used_sectors()
    };

    let fs = Filesys::mount(disk).unwrap();
    assert_eq!(fs.used_sectors(), used);
    let mut file = open_file(&fs, "/home/keep");
    let mut buf = [0u8; 15];
    assert_eq!(file.read(&fs, &mut buf), 15);
    assert_eq!(&buf, b"persistent data");
    fs.close(Handle::File(file));

    // The free map still hands out sane sectors after the round trip.
    fs.create("/home/more", None, 4096).unwrap();
    let mut file = open_file(&fs, "/home/more");
    let mut buf = vec![1u8; 4096];
    assert_eq!(file.read(&fs, &mut buf), 4096);
    assert!(buf.iter().all(|&b| b == 0));
    fs.close(Handle::File(file));
}

#[test]
fn out_of_space_rolls_back() {
    let _ = env_logger::builder().is_test(true).try_init();
    // Small volume: formatting takes a handful of sectors, the rest is data.
    let fs = Filesys::format(Arc::new(MemDisk::new(64))).unwrap();
    let before = fs.used_sectors();

    fs.create("hog", None, 0).unwrap();
    let after_create = fs.used_sectors();
    let mut file = open_file(&fs, "hog");

    // Far larger than the device; the extension must fail cleanly.
    let huge = vec![0u8; 64 * 512];
    assert_eq!(file.write(&fs, &huge), 0);
    assert_eq!(file.len(&fs), 0);
    assert_eq!(fs.used_sectors(), after_create);

    // The volume keeps working afterwards.
    assert_eq!(file.write(&fs, b"still alive"), 11);
    fs.remove("hog", None).unwrap();
    fs.close(Handle::File(file));
    assert_eq!(fs.used_sectors(), before);
}

#[test]
fn max_file_length_is_enforced() {
    let fs = fresh();
    fs.create("cap", None, 0).unwrap();
    let mut file = open_file(&fs, "cap");
    file.seek(tinyfs::param::MAX_FILE_LEN);
    assert_eq!(file.write(&fs, b"x"), 0);
    assert_eq!(file.len(&fs), 0);
    fs.close(Handle::File(file));
}
