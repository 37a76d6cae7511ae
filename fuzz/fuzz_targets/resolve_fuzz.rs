#![no_main]
use libfuzzer_sys::fuzz_target;
use namei::{Credentials, FilesystemManager, OpenOptions, Process};

fuzz_target!(|data: &[u8]| {
    if let Ok(path) = std::str::from_utf8(data) {
        let manager = FilesystemManager::new();
        let Ok(context) = manager.create_context_with_empty_ramfs() else {
            return;
        };
        let process = Process::new(1, Credentials::root(), context);

        // A small tree with a loop and a mount to walk through
        let _ = process.mkdir("/a", 0o755);
        let _ = process.mkdir("/a/b", 0o755);
        let _ = process.symlink("/a/b", "/link");
        let _ = process.symlink("/loop", "/loop");
        let _ = process.symlink("../..", "/a/b/up");

        for options in [
            OpenOptions::empty(),
            OpenOptions::NOFOLLOW,
            OpenOptions::NOFOLLOW_NOERROR,
        ] {
            if let Ok(resolved) = process.resolve(path, options) {
                // The canonical path must resolve to the same inode.
                let canonical = resolved.custody.absolute_path();
                let again = process
                    .resolve(&canonical, OpenOptions::NOFOLLOW_NOERROR)
                    .expect("canonical path resolves");
                assert_eq!(again.custody.identifier(), resolved.custody.identifier());
            }
        }
    }
});
