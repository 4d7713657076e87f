use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use clap::{crate_version, Arg, ArgAction, Command};
use fuser::MountOption;
use log::{error, info, LevelFilter};

use kibosh::conf::{parse_octal_mode, KiboshConf, DEFAULT_CONTROL_MODE};
use kibosh::drop_cache::DEFAULT_DROP_CACHES_PATH;
use kibosh::pidfile;
use kibosh::KiboshFs;

fn init_logging(conf: &KiboshConf) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.format_timestamp_nanos();
    builder.filter_level(if conf.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    if let Some(path) = &conf.log_path {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("unable to open log file {}: {e}", path.display());
                exit(1);
            }
        }
    }
    builder.init();
}

fn main() {
    let matches = Command::new("kibosh")
        .version(crate_version!())
        .about("A fault-injecting mirror filesystem")
        .arg(
            Arg::new("target")
                .long("target")
                .short('t')
                .value_name("DIR")
                .required(true)
                .help("The directory to mirror"),
        )
        .arg(
            Arg::new("mount-point")
                .value_name("MOUNT_POINT")
                .required(true)
                .help("Where the mirrored view appears"),
        )
        .arg(
            Arg::new("control-mode")
                .long("control-mode")
                .value_name("OCTAL")
                .help("Permission bits reported for the control file (default 600)"),
        )
        .arg(
            Arg::new("log")
                .long("log")
                .value_name("FILE")
                .help("Write log output to this file instead of stderr"),
        )
        .arg(
            Arg::new("pidfile")
                .long("pidfile")
                .value_name("FILE")
                .help("Write the daemon pid to this file"),
        )
        .arg(
            Arg::new("random-seed")
                .long("random-seed")
                .value_name("N")
                .help("Seed the fault RNG for reproducible runs"),
        )
        .arg(
            Arg::new("cache-drop-period")
                .long("cache-drop-period")
                .value_name("SECS")
                .help("Periodically ask the kernel to drop its page cache"),
        )
        .arg(
            Arg::new("cache-drop-path")
                .long("cache-drop-path")
                .value_name("FILE")
                .default_value(DEFAULT_DROP_CACHES_PATH)
                .help("Where the cache drop request is written"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .help("Enable debug logging"),
        )
        .get_matches();

    let control_mode = match matches.get_one::<String>("control-mode") {
        None => DEFAULT_CONTROL_MODE,
        Some(s) => match parse_octal_mode(s) {
            Ok(mode) => mode,
            Err(e) => {
                eprintln!("{e}");
                exit(1);
            }
        },
    };
    let random_seed = match matches.get_one::<String>("random-seed") {
        None => None,
        Some(s) => match s.parse::<u64>() {
            Ok(seed) => Some(seed),
            Err(e) => {
                eprintln!("invalid random seed {s:?}: {e}");
                exit(1);
            }
        },
    };
    let cache_drop_period = match matches.get_one::<String>("cache-drop-period") {
        None => None,
        Some(s) => match s.parse::<u64>() {
            Ok(0) | Err(_) => {
                eprintln!("invalid cache drop period {s:?}");
                exit(1);
            }
            Ok(secs) => Some(Duration::from_secs(secs)),
        },
    };

    let mut conf = KiboshConf {
        target_path: PathBuf::from(matches.get_one::<String>("target").unwrap()),
        control_mode,
        log_path: matches.get_one::<String>("log").map(PathBuf::from),
        pidfile_path: matches.get_one::<String>("pidfile").map(PathBuf::from),
        random_seed,
        verbose: matches.get_flag("verbose"),
        cache_drop_period,
        cache_drop_path: PathBuf::from(matches.get_one::<String>("cache-drop-path").unwrap()),
    };
    if let Err(e) = conf.reify() {
        eprintln!("bad configuration: {e}");
        exit(1);
    }
    init_logging(&conf);
    info!("starting with configuration {conf}");

    let mount_point = PathBuf::from(matches.get_one::<String>("mount-point").unwrap());
    if kibosh::conf::is_within(&mount_point, &conf.target_path) {
        error!(
            "mount point {} is inside the target {}",
            mount_point.display(),
            conf.target_path.display()
        );
        exit(1);
    }

    // Created inodes carry exactly the mode the kernel computed from the
    // caller's umask.
    unsafe {
        libc::umask(0);
    }

    let fs = match KiboshFs::new(&conf) {
        Ok(fs) => fs,
        Err(e) => {
            error!("error initializing filesystem: {e}");
            exit(1);
        }
    };

    if let Some(path) = &conf.pidfile_path {
        if pidfile::write_pidfile(path).is_err() {
            exit(1);
        }
    }

    let options = [
        MountOption::FSName("kibosh".to_string()),
        MountOption::AllowOther,
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
    ];
    let result = fuser::mount2(fs, &mount_point, &options);

    if let Some(path) = &conf.pidfile_path {
        pidfile::remove_pidfile(path);
    }
    match result {
        Ok(()) => info!("exiting"),
        Err(e) => {
            // Permission denied usually means user_allow_other is missing
            // from /etc/fuse.conf.
            error!("mount failed: {e}");
            if e.kind() == ErrorKind::PermissionDenied {
                exit(2);
            }
            exit(1);
        }
    }
}
