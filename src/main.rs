//! pvr - versioned device state command line interface

use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use serde_json::{Map, Value};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use pvr::ops::{
    check_objects, commit, diff, dm_apply, dm_convert, export, import, mk_overlay, reset, stage,
    status, ResetOptions,
};
use pvr::session::{
    CleanupRegistry, CredentialPrompt, Credentials, NoPrompt, Session, TtyPrompt,
};
use pvr::sig::{sign, verify, verify_all, SignMatch, SignOptions, VerifyKey};
use pvr::source::{install_rootfs, SourceOptions};
use pvr::transport::{self, GetOptions, PostOptions, Progress, TracingRenderer};
use pvr::{json, EnvConfig, Error, Fragment, MergeMode, Repo, SystemTools};

#[derive(Parser)]
#[command(name = "pvr")]
#[command(about = "versioned, content-addressed device state")]
#[command(version)]
struct Cli {
    /// repository path
    #[arg(short = 'C', long, default_value = ".")]
    repo: PathBuf,

    /// more logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// initialize a new repository
    Init {
        /// path to create repository at
        #[arg(default_value = ".")]
        path: PathBuf,

        /// keep objects in this directory instead of .pvr/objects
        #[arg(long)]
        objects: Option<PathBuf>,
    },

    /// stage files for the next commit
    Add {
        /// globs of keys to stage; all files when empty
        globs: Vec<String>,

        /// store even json files as objects
        #[arg(long)]
        force_object: bool,
    },

    /// show working copy changes
    Status,

    /// print the working copy changes as a json merge patch
    Diff,

    /// commit the working copy into the pristine state
    Commit {
        /// commit message
        #[arg(short, long, default_value = "")]
        message: String,

        /// mark the new state as a checkpoint
        #[arg(long)]
        checkpoint: bool,
    },

    /// rewrite the working copy from the pristine state
    #[command(alias = "checkout")]
    Reset {
        /// hard-link objects out of the pool instead of copying
        #[arg(long)]
        hardlink: bool,

        /// write inline json canonically
        #[arg(long)]
        canonical: bool,
    },

    /// fetch a remote state and merge it into the pristine state
    Get {
        /// remote url or path, with optional #fragment; defaults to the repo's get url
        url: Option<String>,

        /// merge-patch instead of replacing the selected keys
        #[arg(long)]
        merge: bool,

        /// destination fragment, when different from the source one
        #[arg(long)]
        into: Option<String>,
    },

    /// download a remote state's objects without merging
    Fetch {
        /// remote url or path, with optional #fragment
        url: Option<String>,
    },

    /// create a repository from a remote and check it out
    Clone {
        /// remote url or path, with optional #fragment
        url: String,

        /// destination directory; defaults to the last url segment
        dir: Option<PathBuf>,
    },

    /// upload objects and post the pristine state to a remote
    Post {
        /// remote url or path, with optional #fragment; defaults to the repo's post url
        url: Option<String>,

        /// commit message sent with the state
        #[arg(short, long)]
        message: Option<String>,

        /// revision to post as
        #[arg(long)]
        rev: Option<i64>,

        /// extra envelope fields as a json object
        #[arg(long)]
        envelope: Option<String>,

        /// re-upload objects the remote already has
        #[arg(short, long)]
        force: bool,
    },

    /// write the pristine state and its objects to a tarball
    Export {
        /// output archive (.tar or .tar.gz)
        dst: PathBuf,

        /// fragment selecting the exported keys
        #[arg(long, default_value = "")]
        parts: String,
    },

    /// load a tarball written by export
    Import {
        /// input archive
        src: PathBuf,
    },

    /// detached signatures over parts of the state
    Sig {
        #[command(subcommand)]
        command: SigCommands,
    },

    /// dm-verity protection of container volumes
    Dm {
        #[command(subcommand)]
        command: DmCommands,
    },

    /// build an overlay upper tree turning one tree into another
    Overlay {
        /// lower tree
        lower: PathBuf,

        /// target tree
        target: PathBuf,

        /// upper tree to create
        out: PathBuf,
    },

    /// container root filesystems
    App {
        #[command(subcommand)]
        command: AppCommands,
    },

    /// check the objects referenced by the pristine state
    Fsck,
}

#[derive(Subcommand)]
enum SigCommands {
    /// sign a part of the pristine state
    Add {
        /// rsa private key (pem)
        #[arg(long)]
        key: PathBuf,

        /// part of the state to sign
        #[arg(long, default_value = "")]
        part: String,

        /// include globs relative to the part
        #[arg(long)]
        include: Vec<String>,

        /// exclude globs relative to the part
        #[arg(long)]
        exclude: Vec<String>,

        /// certificate chain to embed as x5c
        #[arg(long)]
        x5c: Option<PathBuf>,
    },

    /// verify signatures of the pristine state
    Verify {
        /// public key or certificate (pem)
        #[arg(long, conflicts_with = "cacerts")]
        pubkey: Option<PathBuf>,

        /// ca bundle for x5c chains, or _system_
        #[arg(long)]
        cacerts: Option<String>,

        /// only this signature file; all pvs.json keys otherwise
        #[arg(long)]
        pvs: Option<String>,

        /// include the signed payload in the output
        #[arg(long)]
        with_payload: bool,
    },
}

#[derive(Subcommand)]
enum DmCommands {
    /// protect a container volume with dm-verity
    Convert {
        container: String,
        volume: String,
    },

    /// regenerate hash devices for verity manifests
    Apply {
        /// only manifests under this prefix
        #[arg(default_value = "")]
        prefix: String,
    },
}

#[derive(Subcommand)]
enum AppCommands {
    /// pull an image into <container>/root.squashfs and stage it
    Install {
        container: String,

        /// image reference, e.g. alpine:3.20
        reference: String,

        /// platform to pick from multi-arch images
        #[arg(long)]
        arch: Option<String>,

        /// mksquashfs compressor
        #[arg(long, default_value = pvr::source::DEFAULT_COMPRESSION)]
        compression: String,

        /// extra paths to remove from the root filesystem
        #[arg(long)]
        strip: Vec<String>,

        /// registry user
        #[arg(long, env = "PVR_REGISTRY_USERNAME")]
        username: Option<String>,

        /// registry password
        #[arg(long, env = "PVR_REGISTRY_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// never use a local docker daemon
        #[arg(long)]
        no_local: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let env = EnvConfig::from_env();
    init_tracing(cli.verbose, env.debug);

    // before any worker thread exists so they inherit the signal mask
    let cleanup = CleanupRegistry::new();
    if let Err(e) = cleanup.install_handler() {
        eprintln!("error: {}", e);
        return ExitCode::from(e.exit_code());
    }

    if let Err(e) = run(cli, env, cleanup) {
        eprintln!("error: {}", e);
        ExitCode::from(e.exit_code())
    } else {
        ExitCode::SUCCESS
    }
}

fn init_tracing(verbose: u8, debug: bool) {
    let level = match (verbose, debug) {
        (0, false) => LevelFilter::INFO,
        (0, true) | (1, _) => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var("PVR_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn run(cli: Cli, env: EnvConfig, cleanup: CleanupRegistry) -> pvr::Result<()> {
    match cli.command {
        Commands::Init { path, objects } => {
            Repo::init_with_pool(&path, objects)?;
            println!("initialized pvr repository at {}", path.display());
        }

        Commands::Add {
            globs,
            force_object,
        } => {
            let repo = Repo::find(&cli.repo)?;
            for key in stage(&repo, &globs, force_object)? {
                println!("added {}", key);
            }
        }

        Commands::Status => {
            let repo = Repo::find(&cli.repo)?;
            let status = status(&repo)?;
            for (prefix, keys) in [
                ("A", &status.new),
                ("C", &status.changed),
                ("D", &status.removed),
                ("?", &status.untracked),
            ] {
                for key in keys {
                    println!("{} {}", prefix, key);
                }
            }
        }

        Commands::Diff => {
            let repo = Repo::find(&cli.repo)?;
            print_json(&diff(&repo)?)?;
        }

        Commands::Commit {
            message,
            checkpoint,
        } => {
            let repo = Repo::find(&cli.repo)?;
            let summary = commit(&repo, &message, checkpoint)?;
            if summary.status.is_clean() {
                println!("nothing to commit");
            } else {
                println!(
                    "committed {} new, {} changed, {} removed ({} objects pooled)",
                    summary.status.new.len(),
                    summary.status.changed.len(),
                    summary.status.removed.len(),
                    summary.pooled
                );
            }
        }

        Commands::Reset {
            hardlink,
            canonical,
        } => {
            let repo = Repo::find(&cli.repo)?;
            reset(
                &repo,
                ResetOptions {
                    hardlink,
                    canonical,
                },
            )?;
        }

        Commands::Get { url, merge, into } => {
            let repo = Repo::find(&cli.repo)?;
            let url = url
                .or_else(|| repo.config().default_get_url.clone())
                .ok_or_else(|| Error::Missing("remote url (no default get url)".into()))?;
            let session = session(env, cleanup)?;
            let progress = progress();
            let opts = GetOptions {
                mode: if merge {
                    MergeMode::Merge
                } else {
                    MergeMode::Replace
                },
                into: into.as_deref().map(Fragment::parse),
            };
            let result = transport::get(&session, &repo, &url, &opts, &progress);
            progress.finish();
            let fetched = result?;
            println!(
                "got {} keys ({} objects downloaded)",
                fetched.state.len(),
                fetched.download.downloaded
            );
        }

        Commands::Fetch { url } => {
            let repo = Repo::find(&cli.repo)?;
            let url = url
                .or_else(|| repo.config().default_get_url.clone())
                .ok_or_else(|| Error::Missing("remote url (no default get url)".into()))?;
            let session = session(env, cleanup)?;
            let progress = progress();
            let result = transport::fetch(&session, repo.pool(), &url, &progress);
            progress.finish();
            print_json(&result?.state.to_value())?;
        }

        Commands::Clone { url, dir } => {
            let dir = match dir {
                Some(dir) => dir,
                None => default_clone_dir(&url)?,
            };
            let session = session(env, cleanup)?;
            let progress = progress();
            let result = transport::clone(&session, &url, &dir, &progress);
            progress.finish();
            result?;
            println!("cloned into {}", dir.display());
        }

        Commands::Post {
            url,
            message,
            rev,
            envelope,
            force,
        } => {
            let repo = Repo::find(&cli.repo)?;
            let url = url
                .or_else(|| repo.config().default_post_url.clone())
                .or_else(|| repo.config().default_put_url.clone())
                .ok_or_else(|| Error::Missing("remote url (no default post url)".into()))?;
            let envelope = match envelope {
                Some(text) => json::parse_object(text.as_bytes(), "--envelope")?,
                None => Map::new(),
            };
            let session = session(env, cleanup)?;
            let progress = progress();
            let opts = PostOptions {
                message: message.or(repo.commit_message()?),
                rev,
                envelope,
                force,
            };
            let result = transport::post(&session, &repo, &url, &opts, &progress);
            progress.finish();
            let posted = result?;
            println!(
                "posted to {} ({} objects uploaded)",
                url, posted.upload.uploaded
            );
            if let Some(rev) = posted.rev {
                println!("revision {}", rev);
            }
        }

        Commands::Export { dst, parts } => {
            let repo = Repo::find(&cli.repo)?;
            let summary = export(&repo, &Fragment::parse(&parts), &dst, &cleanup)?;
            println!("exported {} objects to {}", summary.objects, dst.display());
        }

        Commands::Import { src } => {
            let repo = Repo::find(&cli.repo)?;
            let summary = import(&repo, &src)?;
            println!("imported {} objects from {}", summary.objects, src.display());
        }

        Commands::Sig { command } => run_sig(&cli.repo, command)?,

        Commands::Dm { command } => {
            let repo = Repo::find(&cli.repo)?;
            let tools = SystemTools::new();
            let volumes = match command {
                DmCommands::Convert { container, volume } => {
                    vec![dm_convert(&repo, &tools, &container, &volume)?]
                }
                DmCommands::Apply { prefix } => dm_apply(&repo, &tools, &prefix)?,
            };
            for volume in volumes {
                println!(
                    "{}/{} root hash {}",
                    volume.container, volume.volume, volume.root_hash
                );
            }
        }

        Commands::Overlay { lower, target, out } => {
            let summary = mk_overlay(&SystemTools::new(), &lower, &target, &out)?;
            println!(
                "{} whiteouts, {} copied into {}",
                summary.whiteouts.len(),
                summary.copied.len(),
                out.display()
            );
        }

        Commands::App { command } => {
            let AppCommands::Install {
                container,
                reference,
                arch,
                compression,
                strip,
                username,
                password,
                no_local,
            } = command;
            let repo = Repo::find(&cli.repo)?;
            let mut opts = SourceOptions {
                compression,
                prefer_local: !no_local,
                credentials: username.map(|u| Credentials::new(u, password.unwrap_or_default())),
                ..SourceOptions::default()
            };
            if let Some(arch) = arch {
                opts.arch = arch;
            }
            opts.strip.extend(strip);

            let session = session(env, cleanup)?;
            let progress = progress();
            let result = install_rootfs(
                &session,
                &SystemTools::new(),
                &repo,
                &container,
                &reference,
                &opts,
                &progress,
            );
            progress.finish();
            let installed = result?;
            println!("{} ({})", installed.image.display(), installed.digest);
        }

        Commands::Fsck => {
            let repo = Repo::find(&cli.repo)?;
            let report = check_objects(&repo)?;

            println!("objects checked: {}", report.objects_checked);

            if !report.corrupt_objects.is_empty() {
                println!("\ncorrupt objects:");
                for obj in &report.corrupt_objects {
                    println!("  {} {}", obj.hash, obj.key);
                }
            }

            if !report.missing_objects.is_empty() {
                println!("\nmissing objects:");
                for obj in &report.missing_objects {
                    println!("  {} (referenced by {})", obj.hash, obj.key);
                }
            }

            if !report.dangling_objects.is_empty() {
                println!("\ndangling objects: {}", report.dangling_objects.len());
            }

            if report.is_ok() {
                println!("\nrepository is healthy");
            } else {
                println!("\nrepository has issues");
                return Err(Error::Missing("objects referenced by the pristine state".into()));
            }
        }
    }

    Ok(())
}

fn run_sig(root: &Path, command: SigCommands) -> pvr::Result<()> {
    let repo = Repo::find(root)?;
    match command {
        SigCommands::Add {
            key,
            part,
            include,
            exclude,
            x5c,
        } => {
            let mut selector = SignMatch::for_part(&part);
            if !include.is_empty() {
                selector.include = include;
            }
            selector.exclude.extend(exclude);
            let opts = SignOptions {
                x5c,
                ..SignOptions::default()
            };
            let pvs_key = sign(&repo, &key, &selector, &opts)?;
            println!("signed {}", pvs_key);
        }

        SigCommands::Verify {
            pubkey,
            cacerts,
            pvs,
            with_payload,
        } => {
            let key = match (pubkey, cacerts) {
                (Some(path), _) => VerifyKey::PublicKey(path),
                (None, Some(store)) => VerifyKey::CaStore(store),
                (None, None) => VerifyKey::CaStore(pvr::sig::SYSTEM_STORE.to_string()),
            };
            let summary = match pvs {
                Some(pvs_key) => verify(&repo, &key, &pvs_key, with_payload)?,
                None => verify_all(&repo, &key, with_payload)?,
            };
            let value = serde_json::to_value(&summary)
                .map_err(|e| Error::Malformed {
                    what: "verify summary",
                    message: e.to_string(),
                })?;
            print_json(&value)?;
        }
    }
    Ok(())
}

fn session(env: EnvConfig, cleanup: CleanupRegistry) -> pvr::Result<Session> {
    let prompt: Box<dyn CredentialPrompt> = if io::stdin().is_terminal() {
        Box::new(TtyPrompt)
    } else {
        Box::new(NoPrompt)
    };
    Ok(Session::new(env, prompt)?.with_cleanup(cleanup))
}

fn progress() -> Progress {
    Progress::spawn(Box::new(TracingRenderer::default()))
}

fn print_json(value: &Value) -> pvr::Result<()> {
    let text = json::to_pretty_vec(value)?;
    println!("{}", String::from_utf8_lossy(&text));
    Ok(())
}

/// last path segment of a remote, without fragment or trailing slash
fn default_clone_dir(url: &str) -> pvr::Result<PathBuf> {
    let location = url.split_once('#').map_or(url, |(loc, _)| loc);
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(PathBuf::from)
        .ok_or_else(|| Error::InvalidUrl {
            url: url.to_string(),
            message: "cannot derive a directory name".into(),
        })
}
