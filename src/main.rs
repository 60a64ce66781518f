use std::fs::OpenOptions;
use std::io::{self, Read};
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, error, info, warn, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};

use insights_agent::archive::{should_keep_archive, Archive, Compressor};
use insights_agent::cli::{Args, Commands};
use insights_agent::cloud::{
    create_http_session, resolve_from_env, InsightsService, RegistrationApi, RetryPolicy,
    RuleFetcher, ThreadSleeper, UploadCoordinator, UploadOutcome,
};
use insights_agent::collectors::collector::{Collector, CollectorSettings, TaskCollector};
use insights_agent::collectors::expander::TaskExpander;
use insights_agent::collectors::session::{collect_target, CollectionPlan};
use insights_agent::config::{load_or_create_config, AgentConfig, RemovalPolicy};
use insights_agent::constants::{ERROR_MUST_BE_ROOT, GROUP_METADATA_FILE};
use insights_agent::error::AgentError;
use insights_agent::models::{BranchInfo, Target};
use insights_agent::privileges::{check_privileges, get_elevation_instructions};
use insights_agent::registration::{RegistrationStateMachine, StateStore};
use insights_agent::rules::{
    GpgVerifier, LoadMode, RuleSetResolver, SignatureVerifier, SuppliedRules,
};
use insights_agent::security::{scrub_credentials, ContentNormalizer, KeywordRedactor, Redactor};
use insights_agent::targets::{
    build_group_metadata, determine_hostname, discover_targets, display_name, image_links,
    open_target, BindMount, IdentityStore, MountpointProvider, TargetArchive,
};

fn main() {
    // Parse arguments
    let args = Args::parse();

    match run(&args) {
        Ok(code) => process::exit(code),
        Err(e) => {
            report_error(&e);
            process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<i32> {
    args.validate()?;

    // Handle subcommands
    if let Some(Commands::InitConfig { path }) = &args.command {
        return init_config(path);
    }

    // Load configuration and apply per-run overrides
    let mut config = load_or_create_config(args.config.as_deref())?;
    args.apply_to_config(&mut config);

    initialize_logging(args, &config)?;
    debug!("Configuration: {:?}", config.redacted());

    // Check privileges
    if !check_privileges() && !args.force {
        error!("{}", ERROR_MUST_BE_ROOT);
        info!("{}", get_elevation_instructions());
        return Ok(1);
    }

    if args.validate {
        return validate_removal_file(&config);
    }

    let service = if args.offline {
        None
    } else {
        Some(connect(&config)?)
    };

    let state = StateStore::new(&config.state_dir);
    let identity = IdentityStore::new(&config.state_dir);

    // Registration commands
    if args.status || args.unregister || args.reregister || args.register {
        let service = match &service {
            Some(service) => service,
            None => bail!("Registration commands cannot be used with --offline."),
        };
        let machine = RegistrationStateMachine::new(
            Box::new(service.clone()),
            state.clone(),
            identity.clone(),
            determine_hostname(None),
            config.display_name.clone(),
        );

        if args.status {
            let report = machine.check()?;
            for message in report.messages() {
                println!("{}", message);
            }
            return Ok(if report.is_registered() { 0 } else { 1 });
        }
        if args.unregister {
            machine.unregister()?;
            return Ok(0);
        }
        if args.reregister {
            machine.force_reregister()?;
        } else {
            machine.register()?;
        }
    } else if let Some(service) = &service {
        let machine = RegistrationStateMachine::new(
            Box::new(service.clone()),
            state.clone(),
            identity.clone(),
            determine_hostname(None),
            config.display_name.clone(),
        );
        if let Err(e) = machine.ensure_registered() {
            if args.requires_registration() {
                return Err(e);
            }
            warn!("Registration check failed, continuing since nothing will be uploaded: {:#}", e);
        }
    }

    if let Some(bundle) = &args.just_upload {
        let service = match &service {
            Some(service) => service,
            None => bail!("Can't use --just-upload with --offline."),
        };
        return just_upload(bundle, service, &config, &state, &identity);
    }

    // Obtain collection rules and the removal policy
    let verifier: Option<Box<dyn SignatureVerifier>> = if config.gpg {
        Some(Box::new(GpgVerifier::new(&config.gpg_keyring)))
    } else {
        None
    };
    let fetcher = service
        .clone()
        .map(|s| Box::new(s) as Box<dyn RuleFetcher>);
    let resolver = RuleSetResolver::new(
        &config.rules_dir,
        config.collection_rules_url(),
        &config.remove_file,
        verifier,
        fetcher,
    );
    let mode = load_mode(args, &config)?;
    let supplied_branch = match &mode {
        LoadMode::FromSuppliedDocument(supplied) => supplied.branch_info.clone(),
        _ => None,
    };
    let (rules, policy) = resolver.load(&mode)?;

    let branch_info = match supplied_branch {
        Some(branch_info) => branch_info,
        None => resolve_branch_info(service.as_ref(), args)?,
    };
    debug!("Branch info: {:?}", branch_info);

    // Collect every target into its own archive
    let started = Instant::now();
    let collector: Arc<dyn TaskCollector> = Arc::new(Collector::new(CollectorSettings {
        command_timeout: Duration::from_secs(config.cmd_timeout_secs),
        spool_dir: std::env::temp_dir(),
        normalizer: Arc::new(ContentNormalizer::load(&config.sed_file)),
    }));
    let expander = TaskExpander::live(Duration::from_secs(config.cmd_timeout_secs))
        .with_original_style(args.original_style_specs);
    let plan = CollectionPlan {
        rules: &rules,
        policy: &policy,
        branch_info: &branch_info,
        compressor: config.compressor,
        log_file: Some(config.log_file.as_path()),
        staging_base: None,
    };
    let redactor = config.obfuscate.then(|| {
        KeywordRedactor::new(policy.redaction_keywords.clone(), config.obfuscate_hostname)
    });
    let redactor = redactor.as_ref().map(|r| r as &dyn Redactor);

    let hostname = determine_hostname(None);
    let mut collected: Vec<(Archive, TargetArchive)> = Vec::new();
    for target in analysis_targets(args, &hostname)? {
        let mount: Box<dyn MountpointProvider> = match &args.mountpoint {
            Some(path) => Box::new(BindMount::new(path)?),
            None => match open_target(&target) {
                Ok(mount) => mount,
                Err(e) => {
                    error!("Could not open {} {} for analysis: {:#}", target.kind, target.name, e);
                    continue;
                }
            },
        };

        let target_id = identity.target_id(&target)?;
        let archive_name = if target.is_host() {
            hostname.clone()
        } else {
            target.name.clone()
        };
        let mut archive = collect_target(
            &plan,
            &expander,
            Arc::clone(&collector),
            &target,
            &target_id,
            &archive_name,
            mount,
        )?;

        if args.no_tar_file {
            let kept = archive.retain();
            info!("See Insights data in {}", kept.display());
            return Ok(0);
        }
        archive.finalize(redactor)?;

        let display = if target.is_host() {
            determine_hostname(config.display_name.as_deref())
        } else {
            display_name(&target)
        };
        collected.push((
            archive,
            TargetArchive {
                target,
                system_id: target_id,
                display_name: display,
            },
        ));
    }

    if collected.is_empty() {
        bail!("Nothing was collected");
    }

    let keep = should_keep_archive(
        args.keep_archive,
        args.offline,
        args.skip_upload(),
        args.no_tar_file,
        config.obfuscate,
    );

    let (mut archive, upload_id) = if args.container {
        let group_id = identity.docker_group_id()?;
        let wrapper = wrap_target_archives(&identity, &group_id, collected, &config, keep)?;
        (wrapper, group_id)
    } else {
        let (archive, info) = collected.remove(0);
        (archive, info.system_id)
    };
    let collection_secs = started.elapsed().as_secs();

    let bundle = match archive.bundle_path() {
        Some(bundle) => bundle.to_path_buf(),
        None => bail!("Archive {} was not finalized", archive.archive_name()),
    };

    // Deliver the bundle
    let code = if args.to_stdout {
        let mut file = std::fs::File::open(&bundle)
            .context(format!("Failed to open {}", bundle.display()))?;
        io::copy(&mut file, &mut io::stdout().lock()).context("Failed to write archive to stdout")?;
        0
    } else if args.skip_upload() || args.offline {
        info!("See Insights data in {}", bundle.display());
        0
    } else {
        match &service {
            Some(service) => upload_bundle(
                service,
                &config,
                &state,
                &bundle,
                archive.compressor(),
                collection_secs,
                &upload_id,
            ),
            None => 0,
        }
    };

    if keep && !args.to_stdout {
        let kept = archive.retain();
        info!("Insights archive retained in {}", kept.display());
    } else {
        archive.delete()?;
    }
    Ok(code)
}

fn initialize_logging(args: &Args, config: &AgentConfig) -> Result<()> {
    let term_level = if args.verbose {
        LevelFilter::Debug
    } else if args.quiet {
        LevelFilter::Error
    } else {
        LevelFilter::Info
    };
    let file_level = if args.verbose {
        LevelFilter::Debug
    } else {
        config.loglevel.parse().unwrap_or(LevelFilter::Info)
    };

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        term_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    let log_file_error = match open_log_file(&config.log_file) {
        Ok(file) => {
            loggers.push(WriteLogger::new(file_level, Config::default(), file));
            None
        }
        Err(e) => Some(e),
    };
    CombinedLogger::init(loggers).context("Failed to initialize logger")?;

    if let Some(e) = log_file_error {
        warn!("Logging to terminal only, cannot open {}: {}", config.log_file.display(), e);
    }
    Ok(())
}

fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn init_config(path: &Path) -> Result<i32> {
    if path.exists() {
        eprintln!("Configuration file {} already exists", path.display());
        return Ok(1);
    }
    load_or_create_config(Some(path))?;
    println!("Configuration written to {}", path.display());
    Ok(0)
}

/// Print the removal policy the next collection would use.
fn validate_removal_file(config: &AgentConfig) -> Result<i32> {
    let policy = RemovalPolicy::validate(&config.remove_file)?;
    if policy.is_empty() {
        println!("{} defines no removals", config.remove_file.display());
        return Ok(0);
    }
    let sections = [
        ("files", policy.excluded_files.iter().cloned().collect::<Vec<_>>()),
        ("commands", policy.excluded_commands.iter().cloned().collect()),
        ("patterns", policy.line_exclude_patterns.clone()),
        ("keywords", policy.redaction_keywords.clone()),
    ];
    for (name, values) in sections.iter().filter(|(_, v)| !v.is_empty()) {
        println!("{}: {}", name, values.join(", "));
    }
    Ok(0)
}

fn connect(config: &AgentConfig) -> Result<InsightsService> {
    let proxy = resolve_from_env(config.proxy.as_deref(), &config.service_host());
    if proxy.is_direct() {
        debug!("Not using a proxy");
    }
    let session = create_http_session(
        config,
        &proxy,
        Duration::from_secs(config.http_timeout_secs),
    )?;
    Ok(InsightsService::new(config, session))
}

fn load_mode(args: &Args, config: &AgentConfig) -> Result<LoadMode> {
    if args.from_stdin {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read collection rules from stdin")?;
        return Ok(LoadMode::FromSuppliedDocument(SuppliedRules::from_json(&text)?));
    }
    if let Some(path) = &args.from_file {
        let text = std::fs::read_to_string(path)
            .context(format!("Failed to read {}", path.display()))?;
        return Ok(LoadMode::FromSuppliedDocument(SuppliedRules::from_json(&text)?));
    }
    if args.update_collection_rules || (config.auto_update && !args.offline) {
        return Ok(LoadMode::ForceRefresh);
    }
    Ok(LoadMode::UseCached)
}

/// Branch info from the service; runs that never upload can do without it.
fn resolve_branch_info(service: Option<&InsightsService>, args: &Args) -> Result<BranchInfo> {
    let service = match service {
        Some(service) => service,
        None => return Ok(BranchInfo::default()),
    };
    match service.branch_info() {
        Ok(info) => Ok(info),
        Err(e) if args.skip_upload() => {
            warn!("Could not determine branch information, using defaults: {:#}", e);
            Ok(BranchInfo::default())
        }
        Err(e) => Err(e),
    }
}

/// The host always comes last.
fn analysis_targets(args: &Args, hostname: &str) -> Result<Vec<Target>> {
    if let Some(path) = &args.mountpoint {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mountpoint".to_string());
        return Ok(vec![Target::image(name)]);
    }
    let mut targets = Vec::new();
    if args.container {
        targets.extend(discover_targets(args.only.as_deref())?);
        info!("Found {} docker targets", targets.len());
    }
    targets.push(Target::host(hostname));
    Ok(targets)
}

/// Bundle the per-target archives into one group archive with `metadata.json`.
fn wrap_target_archives(
    identity: &IdentityStore,
    group_id: &str,
    collected: Vec<(Archive, TargetArchive)>,
    config: &AgentConfig,
    keep: bool,
) -> Result<Archive> {
    let mut wrapper = Archive::new(&determine_hostname(None), config.compressor)?;
    let mut infos = Vec::with_capacity(collected.len());
    for (mut archive, info) in collected {
        if let Some(bundle) = archive.bundle_path() {
            wrapper.add_file(bundle)?;
        }
        if keep {
            archive.retain();
        } else {
            archive.delete()?;
        }
        infos.push(info);
    }
    wrapper.remove_commands_dir()?;

    let links = match identity.machine_id().and_then(|id| image_links(&id)) {
        Ok(links) => links,
        Err(e) => {
            warn!("Could not determine image links: {:#}", e);
            Default::default()
        }
    };
    let metadata = build_group_metadata(group_id, &infos, &links)?;
    let bytes = serde_json::to_vec_pretty(&metadata).context("Failed to serialize group metadata")?;
    wrapper.add_metadata(GROUP_METADATA_FILE, &bytes)?;
    wrapper.finalize(None)?;
    Ok(wrapper)
}

fn upload_bundle(
    service: &InsightsService,
    config: &AgentConfig,
    state: &StateStore,
    bundle: &Path,
    compressor: Compressor,
    collection_secs: u64,
    target_id: &str,
) -> i32 {
    let coordinator = UploadCoordinator::new(
        Box::new(service.clone()),
        Box::new(ThreadSleeper),
        RetryPolicy {
            max_attempts: config.retries,
            delay: Duration::from_secs(config.upload_delay_secs),
        },
        state.clone(),
        &config.log_file,
    );
    match coordinator.upload(bundle, compressor.mime_type(), collection_secs, target_id) {
        UploadOutcome::Success => 0,
        UploadOutcome::FatalUnregistered(since) => {
            report_error(&AgentError::Unregistered(since).into());
            1
        }
        UploadOutcome::Retryable(_) | UploadOutcome::FatalOther(_) => 1,
    }
}

fn just_upload(
    bundle: &Path,
    service: &InsightsService,
    config: &AgentConfig,
    state: &StateStore,
    identity: &IdentityStore,
) -> Result<i32> {
    if !bundle.is_file() {
        bail!("Archive {} does not exist", bundle.display());
    }
    let name = bundle.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    let compressor = Compressor::from_bundle_name(&name).unwrap_or(config.compressor);
    let machine_id = identity.machine_id()?;
    Ok(upload_bundle(service, config, state, bundle, compressor, 0, &machine_id))
}

fn report_error(e: &anyhow::Error) {
    let message = scrub_credentials(&format!("{:#}", e));
    let guidance = e.downcast_ref::<AgentError>().map(AgentError::guidance);
    // Failures before logging is set up go straight to stderr
    if log::max_level() == LevelFilter::Off {
        eprintln!("Error: {}", message);
        if let Some(guidance) = guidance {
            eprintln!("{}", guidance);
        }
        return;
    }
    error!("{}", message);
    if let Some(guidance) = guidance {
        error!("{}", guidance);
    }
}
