//! Byte channels for the duplex loop: a named pipe pair, or a spawned compiler process.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};

use po_core::TransportConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    /// `read` carries compiler -> advisor, `write` advisor -> compiler.
    NamedPipes { read: PathBuf, write: PathBuf },
    Subprocess { program: String, args: Vec<String> },
}

impl Channel {
    pub fn from_config(cfg: &TransportConfig) -> Self {
        if let Some((program, args)) = cfg.command.as_ref().and_then(|c| c.split_first()) {
            return Channel::Subprocess {
                program: program.clone(),
                args: args.to_vec(),
            };
        }
        let (read, write) = pipe_paths(&cfg.pipe_dir, &cfg.pipe_name);
        Channel::NamedPipes { read, write }
    }
}

/// `<dir>/<name>.out` is read, `<dir>/<name>.in` is written.
pub fn pipe_paths(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{name}.out")),
        dir.join(format!("{name}.in")),
    )
}

/// Open both ends of an existing pipe pair.
///
/// The write end is opened first; on a FIFO each open blocks until the compiler opens the
/// matching end, so the compiler must open `.in` for reading before `.out` for writing.
pub fn open_pipes(read: &Path, write: &Path) -> io::Result<(BufReader<File>, BufWriter<File>)> {
    let w = OpenOptions::new().write(true).open(write)?;
    let r = File::open(read)?;
    Ok((BufReader::new(r), BufWriter::new(w)))
}

/// A compiler driven over its stdin/stdout.
pub struct CompilerProcess {
    child: Child,
}

impl CompilerProcess {
    pub fn spawn(program: &str, args: &[String]) -> io::Result<Self> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        Ok(Self { child })
    }

    /// Hand out the child's stdout (our reader) and stdin (our writer). Callable once.
    pub fn take_io(&mut self) -> io::Result<(BufReader<ChildStdout>, BufWriter<ChildStdin>)> {
        let stdout = self.child.stdout.take();
        let stdin = self.child.stdin.take();
        match (stdout, stdin) {
            (Some(o), Some(i)) => Ok((BufReader::new(o), BufWriter::new(i))),
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                "compiler process stdio already taken",
            )),
        }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_names_follow_in_out_convention() {
        let (r, w) = pipe_paths(Path::new("/tmp"), "posetrl_pipe");
        assert_eq!(r, PathBuf::from("/tmp/posetrl_pipe.out"));
        assert_eq!(w, PathBuf::from("/tmp/posetrl_pipe.in"));
    }

    #[test]
    fn command_selects_subprocess() {
        let mut cfg = TransportConfig::default();
        assert!(matches!(Channel::from_config(&cfg), Channel::NamedPipes { .. }));
        cfg.command = Some(vec!["opt".to_string(), "-O2".to_string()]);
        assert_eq!(
            Channel::from_config(&cfg),
            Channel::Subprocess {
                program: "opt".to_string(),
                args: vec!["-O2".to_string()],
            }
        );
    }

    #[test]
    fn missing_pipes_are_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let (r, w) = pipe_paths(dir.path(), "nope");
        let err = open_pipes(&r, &w).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn subprocess_echo_round_trip() {
        use std::io::{Read, Write};

        let mut p = CompilerProcess::spawn("cat", &[]).unwrap();
        let (mut r, mut w) = p.take_io().unwrap();
        w.write_all(b"ping").unwrap();
        w.flush().unwrap();
        drop(w);
        let mut got = String::new();
        r.read_to_string(&mut got).unwrap();
        assert_eq!(got, "ping");
        assert!(p.wait().unwrap().success());
        assert!(p.take_io().is_err());
    }
}
