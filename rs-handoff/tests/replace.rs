use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use handoff::{BinaryReplacer, FileLock, LockMode, ReplaceError};

fn write(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn replaces_binary_contents() {
    let dir = tempfile::tempdir().unwrap();
    let bin = write(dir.path(), "bin", b"v1");
    let v2 = write(dir.path(), "v2", b"v2");

    BinaryReplacer::new(&bin).replace(&v2).unwrap();
    assert_eq!(fs::read(&bin).unwrap(), b"v2");

    // two independent replacers racing on the same path
    let v3 = write(dir.path(), "v3", b"v3");
    let v4 = write(dir.path(), "v4", b"v4");
    let barrier = Arc::new(Barrier::new(2));
    let racers: Vec<_> = [v3, v4]
        .into_iter()
        .map(|candidate| {
            let bin = bin.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let replacer = BinaryReplacer::new(&bin);
                barrier.wait();
                replacer.replace(&candidate)
            })
        })
        .collect();
    for racer in racers {
        racer.join().unwrap().unwrap();
    }

    let last = fs::read(&bin).unwrap();
    assert!(last == b"v3" || last == b"v4", "got {:?}", last);
}

#[test]
fn concurrent_replacements_never_tear() {
    let dir = tempfile::tempdir().unwrap();
    let size = 256 * 1024;
    let bin = write(dir.path(), "bin", &vec![b'0'; size]);
    let candidates: Vec<PathBuf> = (1..=6u8)
        .map(|i| write(dir.path(), &format!("c{i}"), &vec![b'0' + i; size]))
        .collect();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let bin = bin.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut reads = 0;
            while !done.load(Ordering::SeqCst) || reads == 0 {
                let bytes = fs::read(&bin).unwrap();
                assert_eq!(bytes.len(), size);
                assert!(
                    bytes.iter().all(|&b| b == bytes[0]),
                    "observed a mixed binary"
                );
                reads += 1;
            }
            reads
        })
    };

    let writers: Vec<_> = candidates
        .iter()
        .cloned()
        .map(|candidate| {
            let bin = bin.clone();
            thread::spawn(move || BinaryReplacer::new(&bin).replace(&candidate))
        })
        .collect();
    for writer in writers {
        writer.join().unwrap().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    assert!(reader.join().unwrap() > 0);

    let last = fs::read(&bin).unwrap();
    assert!(candidates.iter().any(|c| fs::read(c).unwrap() == last));
}

#[test]
fn missing_candidate_preserves_original() {
    let dir = tempfile::tempdir().unwrap();
    let bin = write(dir.path(), "bin", b"original");
    let replacer = BinaryReplacer::new(&bin);

    let err = replacer
        .replace(&dir.path().join("no-such-candidate"))
        .unwrap_err();
    assert!(matches!(err, ReplaceError::Candidate { .. }));
    assert_eq!(fs::read(&bin).unwrap(), b"original");

    // the lock was released on the error path
    let free = FileLock::new(replacer.lock_path()).with_mode(LockMode::NonBlocking);
    free.acquire().unwrap();

    let next = write(dir.path(), "next", b"next");
    replacer.replace(&next).unwrap();
    assert_eq!(fs::read(&bin).unwrap(), b"next");
}

#[test]
fn waits_for_holder_then_installs() {
    let dir = tempfile::tempdir().unwrap();
    let bin = write(dir.path(), "bin", b"v1");
    let v2 = write(dir.path(), "v2", b"v2");
    let replacer = BinaryReplacer::new(&bin);

    let held = FileLock::new(replacer.lock_path()).acquire().unwrap();
    let waiter = {
        let replacer = replacer.clone();
        thread::spawn(move || replacer.replace(&v2))
    };
    thread::sleep(std::time::Duration::from_millis(100));
    assert_eq!(fs::read(&bin).unwrap(), b"v1");

    held.release().unwrap();
    waiter.join().unwrap().unwrap();
    assert_eq!(fs::read(&bin).unwrap(), b"v2");
}

#[test]
fn timed_out_lock_leaves_binary_alone() {
    let dir = tempfile::tempdir().unwrap();
    let bin = write(dir.path(), "bin", b"v1");
    let v2 = write(dir.path(), "v2", b"v2");
    let replacer = BinaryReplacer::new(&bin)
        .with_lock_mode(LockMode::Timeout(std::time::Duration::from_millis(50)));

    let _held = FileLock::new(replacer.lock_path()).acquire().unwrap();
    let err = replacer.replace(&v2).unwrap_err();
    match err {
        ReplaceError::Lock(lock) => assert!(lock.is_retryable()),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(fs::read(&bin).unwrap(), b"v1");
}
