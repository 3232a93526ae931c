//! `musclefsctl`: the operator-facing CLI (spec.md §6). Every subcommand
//! either inspects persisted state directly or, for `control`, proxies a
//! line to the running server's control file. Usage errors are handled by
//! `clap` itself and already exit 2.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use rand::RngCore;

use musclefs::block::BlockRef;
use musclefs::codec::NodeRecord;
use musclefs::config;
use musclefs::pointer::Pointer;
use musclefs::setup;
use musclefs::tree::TreeBuilder;
use musclefs::treestore::CANONICAL_TAG;

#[derive(Parser)]
#[command(name = "musclefsctl", version, about = "Operate on a musclefs data directory")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh `config` file under a new base directory.
    Init {
        base_dir: PathBuf,
        #[arg(long, default_value = "tcp")]
        listen_net: String,
        #[arg(long, default_value = "127.0.0.1:5640")]
        listen_addr: String,
        #[arg(long)]
        mount: String,
        #[arg(long, default_value = "disk")]
        storage: String,
        #[arg(long)]
        cache_directory: PathBuf,
    },
    /// Show the pending pull worklog against the remote base, without applying it.
    Diff { base_dir: PathBuf },
    /// Print the revisions following the local base, most recent first.
    History {
        base_dir: PathBuf,
        #[arg(long, default_value_t = 20)]
        max: usize,
    },
    /// List keys held in the local cache store.
    List { base_dir: PathBuf },
    /// List every pointer reachable from the local root.
    Reachable { base_dir: PathBuf },
    /// Delete cache entries not reachable from the local root.
    Clean { base_dir: PathBuf },
    /// Drain the propagation log's currently pending entries once.
    Upload { base_dir: PathBuf },
    /// Print the platform mount command for this data directory.
    Mount { base_dir: PathBuf },
    /// Print the platform unmount command for this data directory.
    Umount { base_dir: PathBuf },
    /// Send one line to the running server's control file and print the reply.
    Control { base_dir: PathBuf, line: String },
    /// Print the CLI's own version.
    Version,
}

fn fatal(msg: impl std::fmt::Display) -> ! {
    eprintln!("musclefsctl: {msg}");
    std::process::exit(1);
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    match args.command {
        Command::Init { base_dir, listen_net, listen_addr, mount, storage, cache_directory } => {
            cmd_init(&base_dir, &listen_net, &listen_addr, &mount, &storage, &cache_directory)
        }
        Command::Diff { base_dir } => cmd_diff(&base_dir),
        Command::History { base_dir, max } => cmd_history(&base_dir, max),
        Command::List { base_dir } => cmd_list(&base_dir),
        Command::Reachable { base_dir } => cmd_reachable(&base_dir),
        Command::Clean { base_dir } => cmd_clean(&base_dir),
        Command::Upload { base_dir } => cmd_upload(&base_dir),
        Command::Mount { base_dir } => cmd_mount(&base_dir),
        Command::Umount { base_dir } => cmd_umount(&base_dir),
        Command::Control { base_dir, line } => cmd_control(&base_dir, &line),
        Command::Version => {
            println!("musclefsctl {}", env!("CARGO_PKG_VERSION"));
        }
    }
}

fn cmd_init(base_dir: &Path, listen_net: &str, listen_addr: &str, mount: &str, storage: &str, cache_directory: &Path) {
    if let Err(e) = std::fs::create_dir_all(base_dir) {
        fatal(format!("create base_dir: {e}"));
    }
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    let contents = format!(
        "listen-net {listen_net}\nlisten-addr {listen_addr}\nmusclefs-mount {mount}\n\
         encryption-key {}\nstorage {storage}\ncache-directory {}\n",
        hex::encode(key),
        cache_directory.display(),
    );
    let path = base_dir.join("config");
    if let Err(e) = std::fs::write(&path, &contents) {
        fatal(format!("write config: {e}"));
    }
    if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)) {
        fatal(format!("set config permissions: {e}"));
    }
    println!("wrote {}", path.display());
}

fn load_config(base_dir: &Path) -> config::Config {
    match config::load(&base_dir.join("config")) {
        Ok(cfg) => cfg,
        Err(e) => fatal(format!("load config: {e}")),
    }
}

fn cmd_diff(base_dir: &Path) {
    let cfg = load_config(base_dir);
    let stack = setup::open(base_dir, &cfg).unwrap_or_else(|e| fatal(format!("open store stack: {e}")));
    let mut builder = TreeBuilder::new(stack.store.clone(), stack.factory.clone()).with_mutable();
    if let Ok(root) = stack.store.local_root_key() {
        builder = builder.with_root(root);
    }
    let mut tree = builder.build().unwrap_or_else(|e| fatal(format!("build tree: {e}")));
    match tree.diff() {
        Ok(worklog) if worklog.is_empty() => println!("up to date"),
        Ok(worklog) => println!("{worklog}"),
        Err(e) => fatal(e),
    }
}

fn cmd_history(base_dir: &Path, max: usize) {
    let cfg = load_config(base_dir);
    let stack = setup::open(base_dir, &cfg).unwrap_or_else(|e| fatal(format!("open store stack: {e}")));
    let head = stack
        .store
        .local_base_pointer()
        .unwrap_or_else(|_| stack.store.local_root_key().unwrap_or(Pointer::NULL));
    if head.is_null() {
        println!("no history");
        return;
    }
    for rev in stack.store.history(max, head, CANONICAL_TAG) {
        println!("{} {} {}", rev.pointer.to_hex(), rev.host, rev.when);
    }
}

fn cmd_list(base_dir: &Path) {
    let cfg = load_config(base_dir);
    let stack = setup::open(base_dir, &cfg).unwrap_or_else(|e| fatal(format!("open store stack: {e}")));
    match stack.factory.cache().list() {
        Ok(keys) => {
            for key in keys {
                println!("{key}");
            }
        }
        Err(e) => fatal(e),
    }
}

/// Walk every pointer reachable from `root` by loading each node and
/// following its sealed child and block references.
fn collect_reachable(store: &musclefs::treestore::TreeStore, root: Pointer) -> HashSet<Pointer> {
    let mut seen = HashSet::new();
    if root.is_null() {
        return seen;
    }
    let mut pending = vec![root];
    while let Some(pointer) = pending.pop() {
        if !seen.insert(pointer) {
            continue;
        }
        let record: NodeRecord = match store.load_node(pointer) {
            Ok(r) => r,
            Err(_) => continue,
        };
        for child in record.children.iter().chain(record.blocks.iter()) {
            if let BlockRef::Sealed(p) = child {
                pending.push(*p);
            }
        }
    }
    seen
}

fn cmd_reachable(base_dir: &Path) {
    let cfg = load_config(base_dir);
    let stack = setup::open(base_dir, &cfg).unwrap_or_else(|e| fatal(format!("open store stack: {e}")));
    let root = stack.store.local_root_key().unwrap_or(Pointer::NULL);
    for pointer in collect_reachable(&stack.store, root) {
        println!("{}", pointer.to_hex());
    }
}

fn cmd_clean(base_dir: &Path) {
    let cfg = load_config(base_dir);
    let stack = setup::open(base_dir, &cfg).unwrap_or_else(|e| fatal(format!("open store stack: {e}")));
    let root = stack.store.local_root_key().unwrap_or(Pointer::NULL);
    let reachable = collect_reachable(&stack.store, root);
    let keys = stack.factory.cache().list().unwrap_or_else(|e| fatal(format!("list cache: {e}")));
    let mut removed = 0;
    for key in keys {
        let keep = key
            .parse::<Pointer>()
            .map(|p| reachable.contains(&p))
            .unwrap_or(true);
        if !keep {
            if let Err(e) = stack.factory.cache().delete(&key) {
                eprintln!("musclefsctl: failed to delete {key}: {e}");
                continue;
            }
            removed += 1;
        }
    }
    println!("removed {removed} unreachable entries");
}

fn cmd_upload(base_dir: &Path) {
    let cfg = load_config(base_dir);
    let stack = setup::open(base_dir, &cfg).unwrap_or_else(|e| fatal(format!("open store stack: {e}")));
    stack.factory.paired().drain_once();
    println!("drained pending uploads");
}

fn cmd_mount(base_dir: &Path) {
    let cfg = load_config(base_dir);
    println!("mount -t 9p -o trans=tcp,port={} 127.0.0.1 {}", cfg.listen_addr, cfg.musclefs_mount);
}

fn cmd_umount(base_dir: &Path) {
    let cfg = load_config(base_dir);
    println!("umount {}", cfg.musclefs_mount);
}

fn cmd_control(base_dir: &Path, line: &str) {
    let cfg = load_config(base_dir);
    let ctl_path = Path::new(&cfg.musclefs_mount).join("muscle").join("ctl");
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&ctl_path)
        .unwrap_or_else(|e| fatal(format!("open {}: {e}", ctl_path.display())));
    let mut text = line.to_string();
    if !text.ends_with('\n') {
        text.push('\n');
    }
    file.write_all(text.as_bytes()).unwrap_or_else(|e| fatal(format!("write control file: {e}")));
    let mut reply = String::new();
    file.read_to_string(&mut reply).unwrap_or_else(|e| fatal(format!("read control file: {e}")));
    print!("{reply}");
}
