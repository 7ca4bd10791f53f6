//! Helpers shared by the unit tests: executable bash stubs that stand in for
//! yt-dlp and ffmpeg, and resolvers wired to them.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::resolver::{ExternalResolver, ResolverConfig};

/// Writes an executable script called `name` whose body is `script`.
pub fn write_named_stub(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/usr/bin/env bash\nset -u\n{script}\n")).unwrap();
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }
    path
}

/// Writes an executable `yt-dlp` replacement whose body is `script`.
pub fn write_stub(dir: &Path, script: &str) -> PathBuf {
    write_named_stub(dir, "yt-dlp", script)
}

/// `ffmpeg` replacement that copies stdin to stdout unchanged.
pub fn passthrough_transcoder(dir: &Path) -> PathBuf {
    write_named_stub(dir, "ffmpeg", "exec cat")
}

/// Stub that emits metadata for `--dump-single-json` and `bytes` bytes of
/// media otherwise.
pub fn media_stub(dir: &Path, title: &str, bytes: usize) -> PathBuf {
    write_stub(
        dir,
        &format!(
            r#"for arg in "$@"; do
  if [[ "$arg" == "--dump-single-json" ]]; then
    printf '%s' '{{"title":"{title}","duration":42,"uploader":"Stub"}}'
    exit 0
  fi
done
head -c {bytes} /dev/zero | tr '\0' 'x'"#
        ),
    )
}

/// Resolver for `program` with a passthrough transcoder written next to it.
pub fn resolver_with_stub(program: PathBuf) -> ExternalResolver {
    let transcoder = passthrough_transcoder(program.parent().unwrap());
    ExternalResolver::new(ResolverConfig {
        program,
        transcoder,
        cookies_file: None,
        metadata_timeout: Duration::from_secs(10),
        download_timeout: Duration::from_secs(10),
        kill_grace: Duration::from_millis(500),
        ..ResolverConfig::default()
    })
}

/// A killed process may linger as a zombie until whoever inherited it reaps
/// it; that counts as gone.
pub fn process_gone(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| state == 'Z' || state == 'X'),
    }
}

pub async fn wait_until_gone(pid: u32) -> bool {
    for _ in 0..100 {
        if process_gone(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
