use std::fs;
use std::path::PathBuf;

use datapile::{
    CacheStore, Checkout, ErrorKind, MemoryHistory, Revision, Scope, Transfer, Workspace,
};
use tempfile::tempdir;

mod util;
use util::{file_url, workspace, write};

/// Copies the pointer files of `from` into `to`, the way a git clone would.
fn clone_pointers(from: &Workspace<datapile::DirCache>, to: &std::path::Path) {
    for rel in from.tracked().expect("tracked") {
        let pointer = format!("{}.ptr", rel.display());
        let target = to.join(&pointer);
        fs::create_dir_all(target.parent().expect("parent")).expect("mkdir");
        fs::copy(from.root().join(&pointer), target).expect("copy pointer");
    }
}

#[test]
fn push_then_pull_into_a_fresh_workspace() {
    let storage = tempdir().expect("storage");
    let url = file_url(storage.path());

    let alice_dir = tempdir().expect("alice");
    let alice = workspace(alice_dir.path());
    alice.add_remote("storage", &url, true).expect("remote");
    write(alice_dir.path(), "data/a.csv", b"a,b\n1,2\n");
    write(alice_dir.path(), "data/b.csv", b"c,d\n3,4\n");
    write(alice_dir.path(), "models/m.bin", &[42u8; 10_000]);
    for path in ["data/a.csv", "data/b.csv", "models/m.bin"] {
        alice.add(path).expect("add");
    }

    let pushed = alice.push(Scope::Worktree, None).expect("push");
    assert!(pushed.ok());
    assert_eq!(pushed.count(Transfer::Transferred), 3);

    let again = alice.push(Scope::Worktree, None).expect("push again");
    assert!(again.ok());
    assert_eq!(again.count(Transfer::AlreadyPresent), 3);

    let bob_dir = tempdir().expect("bob");
    let bob = workspace(bob_dir.path());
    bob.add_remote("storage", &url, true).expect("remote");
    clone_pointers(&alice, bob_dir.path());

    let pulled = bob.pull(Scope::Worktree, None).expect("pull");
    assert!(pulled.ok(), "{pulled:?}");
    assert_eq!(pulled.fetched.count(Transfer::Transferred), 3);
    assert_eq!(pulled.checkouts.len(), 3);
    for rel in ["data/a.csv", "data/b.csv", "models/m.bin"] {
        assert_eq!(
            fs::read(bob_dir.path().join(rel)).expect("pulled file"),
            fs::read(alice_dir.path().join(rel)).expect("original file"),
        );
    }

    let again = bob.pull(Scope::Worktree, None).expect("pull again");
    assert_eq!(again.fetched.count(Transfer::AlreadyPresent), 3);
    assert!(again
        .checkouts
        .iter()
        .all(|c| matches!(c.result, Ok(Checkout::Unchanged))));
}

#[test]
fn checkout_fetches_missing_content_from_default_remote() {
    let storage = tempdir().expect("storage");
    let url = file_url(storage.path());

    let first_dir = tempdir().expect("first");
    let first = workspace(first_dir.path());
    first.add_remote("origin", &url, true).expect("remote");
    write(first_dir.path(), "photo.raw", b"raw sensor data");
    first.add("photo.raw").expect("add");
    first.push(Scope::Worktree, None).expect("push");

    let second_dir = tempdir().expect("second");
    let second = workspace(second_dir.path());
    second.add_remote("origin", &url, true).expect("remote");
    clone_pointers(&first, second_dir.path());

    assert_eq!(
        second.checkout("photo.raw").expect("checkout"),
        Checkout::Materialized { fetched: true }
    );
    assert_eq!(
        fs::read(second_dir.path().join("photo.raw")).expect("read"),
        b"raw sensor data"
    );
}

#[test]
fn fetch_fills_cache_without_touching_files() {
    let storage = tempdir().expect("storage");
    let url = file_url(storage.path());

    let first_dir = tempdir().expect("first");
    let first = workspace(first_dir.path());
    first.add_remote("origin", &url, true).expect("remote");
    write(first_dir.path(), "x.bin", b"xxxx");
    let id = first.add("x.bin").expect("add").pointer.id;
    first.push(Scope::Worktree, None).expect("push");

    let second_dir = tempdir().expect("second");
    let second = workspace(second_dir.path());
    second.add_remote("origin", &url, true).expect("remote");
    clone_pointers(&first, second_dir.path());

    let report = second.fetch(Scope::Worktree, Some("origin")).expect("fetch");
    assert!(report.ok());
    assert!(second.cache().has(id).expect("has"));
    assert!(!second_dir.path().join("x.bin").exists());
}

#[test]
fn missing_remote_content_is_reported_per_item() {
    let storage = tempdir().expect("storage");
    let url = file_url(storage.path());

    let first_dir = tempdir().expect("first");
    let first = workspace(first_dir.path());
    write(first_dir.path(), "never-pushed.bin", b"local only");
    first.add("never-pushed.bin").expect("add");

    let second_dir = tempdir().expect("second");
    let second = workspace(second_dir.path());
    second.add_remote("origin", &url, true).expect("remote");
    clone_pointers(&first, second_dir.path());

    let report = second.pull(Scope::Worktree, None).expect("pull");
    assert!(!report.ok());
    let failures: Vec<_> = report.fetched.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].1.kind(), ErrorKind::ObjectNotFound);
    let checkout = report.checkouts[0].result.as_ref().expect_err("unavailable");
    assert_eq!(checkout.kind(), ErrorKind::ArtifactUnavailable);
    assert!(!second_dir.path().join("never-pushed.bin").exists());
}

#[test]
fn remote_selection() {
    let dir = tempdir().expect("dir");
    let ws = workspace(dir.path());
    let err = ws.push(Scope::Worktree, None).expect_err("no remotes");
    assert_eq!(err.kind(), ErrorKind::NoDefaultRemote);

    let storage = tempdir().expect("storage");
    ws.add_remote("backup", &file_url(storage.path()), false)
        .expect("remote");
    let err = ws.push(Scope::Worktree, None).expect_err("no default");
    assert_eq!(err.kind(), ErrorKind::NoDefaultRemote);
    let err = ws.push(Scope::Worktree, Some("s3")).expect_err("unknown");
    assert_eq!(err.kind(), ErrorKind::UnknownRemote);
    assert!(ws.push(Scope::Worktree, Some("backup")).expect("push").ok());

    ws.set_default_remote("backup").expect("default");
    let reopened: Workspace<datapile::DirCache> =
        Workspace::open(dir.path()).expect("reopen");
    let (remotes, default) = reopened.remotes();
    assert_eq!(default.as_deref(), Some("backup"));
    assert!(remotes.contains_key("backup"));
}

#[test]
fn pushing_history_scope_uploads_old_versions() {
    let storage = tempdir().expect("storage");
    let url = file_url(storage.path());
    let dir = tempdir().expect("dir");
    let ws = workspace(dir.path());
    ws.add_remote("origin", &url, true).expect("remote");
    let mut history = MemoryHistory::new();

    write(dir.path(), "t.csv", b"v1");
    let v1 = ws.add("t.csv").expect("add").pointer.id;
    ws.commit(&mut history, &[], "v1").expect("commit");
    write(dir.path(), "t.csv", b"v2, longer");
    ws.add("t.csv").expect("add");
    ws.commit(&mut history, &[], "v2").expect("commit");

    let report = ws.push(Scope::AllCommits(&history), None).expect("push");
    assert_eq!(report.items.len(), 2);
    assert!(report.ok());

    // The old version survives gc of the local cache and comes back from the
    // remote on checkout.
    assert_eq!(ws.gc(Scope::Worktree).expect("gc"), 1);
    assert!(!ws.cache().has(v1).expect("has"));
    let c1 = history.find("v1").expect("v1 commit");
    assert_eq!(
        ws.checkout_at(&history, &Revision::Commit(c1), "t.csv")
            .expect("checkout v1"),
        Checkout::Materialized { fetched: true }
    );
    assert_eq!(fs::read(dir.path().join("t.csv")).expect("read"), b"v1");
}

#[test]
fn stray_pointer_files_do_not_block_transfers() {
    let storage = tempdir().expect("storage");
    let url = file_url(storage.path());
    let dir = tempdir().expect("dir");
    let ws = workspace(dir.path());
    ws.add_remote("storage", &url, true).expect("remote");
    let mut history = MemoryHistory::new();

    write(dir.path(), "data/a.csv", b"a,b\n1,2\n");
    ws.add("data/a.csv").expect("add");
    write(dir.path(), "docs/notes.ptr", b"binary weights, see the wiki\n");
    write(dir.path(), "data/broken.csv.ptr", b"format-version: [\n");

    let err = ws.add("docs/notes.ptr").expect_err("named like a pointer");
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(!dir.path().join("docs/notes.ptr.ptr").exists());
    assert_eq!(
        ws.tracked().expect("tracked"),
        vec![PathBuf::from("data/a.csv")]
    );

    // Commits record pointer files as they are.
    ws.commit(&mut history, &[], "snapshot").expect("commit");

    let pushed = ws.push(Scope::AllCommits(&history), None).expect("push");
    assert!(pushed.ok(), "{pushed:?}");
    assert_eq!(pushed.count(Transfer::Transferred), 1);

    let pulled = ws.pull(Scope::Worktree, None).expect("pull");
    assert!(pulled.ok(), "{pulled:?}");
    assert_eq!(pulled.checkouts.len(), 1);
    assert_eq!(ws.gc(Scope::AllCommits(&history)).expect("gc"), 0);

    let err = ws.status("docs/notes").expect_err("malformed");
    assert_eq!(err.kind(), ErrorKind::MalformedPointer);
}
