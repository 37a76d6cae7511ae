#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use namei::modules::veil::Veil;
use namei::OpenOptions;

#[derive(Arbitrary, Debug)]
enum Step {
    Unveil { path: String, permissions: String },
    Check { path: String, options: u32 },
    Lock,
}

fuzz_target!(|steps: Vec<Step>| {
    let mut veil = Veil::new();
    for step in steps {
        match step {
            Step::Unveil { path, permissions } => {
                let before = veil.permissions_for(&path);
                if veil.unveil(&path, &permissions).is_ok() {
                    // Declarations only ever narrow what was granted.
                    if let (Some(before), Some(after)) = (before, veil.permissions_for(&path)) {
                        if !before.is_empty() {
                            assert!(before.contains(after));
                        }
                    }
                }
            }
            Step::Check { path, options } => {
                let _ = veil.check(&path, OpenOptions::from_bits_truncate(options));
            }
            Step::Lock => veil.lock(),
        }
    }
});
