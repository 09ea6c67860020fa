//! opskit CLI - operator toolkit for Azure resources, Kusto and host fleets

use chrono::Utc;
use clap::Parser;
use opskit::azure::loadbalancer::{
    AzLoadBalancerApi, LbAction, LbManager, LbOptions, LbOutcome, LbTarget, ProbeTable, RuleTable,
};
use opskit::azure::storage::{issue_sas, AccountTable, AzStorageApi, ContainerTable, SasRequest, StorageApi};
use opskit::azure::tags::{apply_tags, AzTagsApi, TagMode, TagScope, TagSet, TagsApi};
use opskit::azure::AzCli;
use opskit::batch::{load_targets, BatchRunner, CommandTemplate};
use opskit::config::{
    env_file_from_args, load_env_file, process_env_snapshot, BatchArgs, CliArgs, Commands, EnvCommand, KustoArgs,
    LbArgs, LbCommand, LoadReport, LogFormat, ProcessEnv, PsArgs, StorageCommand, TagsArgs, TagsCommand,
    WatchPortArgs, WatchProcessArgs,
};
use opskit::error::{IoResultExt, OpsError, Result};
use opskit::kusto::{
    kusto_timespan, AccountCache, Authenticator, AzureCliCredential, CommandKind, DeviceCodeCredential,
    HttpTransport, InteractiveBrowser, KustoClient, LegacySettings, ManagedIdentityCredential, MsiEndpoint,
    ReqwestTransport, ServicePrincipalCredential, SilentCachedAccount, TokenExpectation,
};
use opskit::monitor::{
    poll_loop, stop_on_interrupt, PortWatcher, ProcessEvent, ProcessQuery, ProcessSource, ProcessTable, ProcessWatcher,
    SysinfoSource, TcpProbe,
};
use opskit::output::{render, OutputFormat, Tabular};
use opskit::progress::ProgressReporter;
use opskit::select::{default_confirmer, default_selector};
use serde::Serialize;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Managed identity endpoints answer quickly or not at all
const MSI_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    // The env file feeds clap's environment fallbacks, so it goes first
    let argv: Vec<String> = std::env::args_os()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    let env_load = env_file_from_args(&argv).map(|path| {
        let result = load_env_file(&path, &mut ProcessEnv, false);
        (path, result)
    });

    let args = CliArgs::parse_from(&argv);
    init_logging(&args);

    if let Some((path, result)) = env_load {
        match result {
            Ok(report) => tracing::info!(
                "Loaded {} variable(s) from {} ({} already set)",
                report.set.len(),
                path.display(),
                report.skipped.len()
            ),
            Err(e) => exit_with(&e),
        }
    }

    if let Err(e) = run(&args) {
        exit_with(&e);
    }
}

fn init_logging(args: &CliArgs) {
    let level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match args.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn exit_with(err: &OpsError) -> ! {
    let mut shown = err.to_string();
    eprintln!("Error: {}", shown);

    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        let text = cause.to_string();
        if !shown.contains(&text) {
            eprintln!("  caused by: {}", text);
            shown.push('\n');
            shown.push_str(&text);
        }
        source = cause.source();
    }
    std::process::exit(err.exit_code());
}

fn run(args: &CliArgs) -> Result<()> {
    match &args.command {
        Commands::Lb(lb) => cmd_lb(args, lb),
        Commands::Kusto(kusto) => cmd_kusto(args, kusto),
        Commands::Env { action } => cmd_env(args, action),
        Commands::Tags(tags) => cmd_tags(args, tags),
        Commands::Storage { action } => cmd_storage(args, action),
        Commands::Ps(ps) => cmd_ps(args, ps),
        Commands::WatchProcess(watch) => cmd_watch_process(args, watch),
        Commands::WatchPort(watch) => cmd_watch_port(args, watch),
        Commands::Batch(batch) => cmd_batch(args, batch),
    }
}

fn emit<T: Tabular + ?Sized>(format: OutputFormat, data: &T) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    render(format, data, &mut out).map_err(|e| OpsError::io("<stdout>", e))
}

/// One line per event: JSON in JSON mode, otherwise timestamped text
fn emit_event<T: Serialize>(format: OutputFormat, event: &T, text: &str) -> Result<()> {
    let line = match format {
        OutputFormat::Json => serde_json::to_string(event)?,
        _ => format!("{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), text),
    };
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{}", line)
        .and_then(|_| out.flush())
        .map_err(|e| OpsError::io("<stdout>", e))
}

fn az(args: &CliArgs) -> Result<AzCli> {
    Ok(AzCli::new()?.with_subscription(args.subscription.clone()))
}

fn cmd_lb(args: &CliArgs, lb: &LbArgs) -> Result<()> {
    let api = AzLoadBalancerApi::new(az(args)?);
    let selector = default_selector(lb.interactive);
    let confirmer = default_confirmer(args.yes);
    let options = LbOptions {
        dry_run: args.dry_run,
        force: lb.force,
        auto_fix_snat: !lb.no_auto_fix_snat,
    };
    let manager = LbManager::new(&api, selector.as_ref(), confirmer.as_ref(), options);

    let action = match &lb.action {
        LbCommand::Add(rule) => LbAction::Add(rule.to_spec()),
        LbCommand::Update(rule) => LbAction::Update(rule.to_spec()),
        LbCommand::Remove { name } => LbAction::Remove(name.clone()),
        LbCommand::List => LbAction::List,
        LbCommand::AddProbe(probe) => LbAction::AddProbe(probe.to_spec()),
        LbCommand::UpdateProbe(probe) => LbAction::UpdateProbe(probe.to_spec()),
        LbCommand::RemoveProbe { name } => LbAction::RemoveProbe(name.clone()),
        LbCommand::ListProbes => LbAction::ListProbes,
    };

    let outcome = manager.execute(&LbTarget::new(&lb.resource_group, &lb.lb_name), action)?;
    match &outcome {
        LbOutcome::Rules { rules } => emit(args.output, &RuleTable(rules)),
        LbOutcome::Probes { probes } => emit(args.output, &ProbeTable(probes)),
        other if args.output == OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(other)?);
            Ok(())
        }
        other => {
            println!("{}", other);
            Ok(())
        }
    }
}

fn kusto_authenticator(k: &KustoArgs, transport: &Arc<dyn HttpTransport>) -> Result<Authenticator> {
    let expectation = TokenExpectation {
        tenant: k.tenant.clone(),
        account: k.account.clone(),
    };
    let mut auth = Authenticator::new(&k.cluster, expectation).with_primary_supported(!k.legacy_auth);
    let az = AzCli::new().ok();

    if let (Some(tenant), Some(client_id), Some(secret)) = (&k.tenant, &k.client_id, &k.client_secret) {
        auth = auth.with_primary(Box::new(ServicePrincipalCredential::new(
            transport.clone(),
            &k.authority,
            tenant,
            client_id,
            secret,
        )));
    }

    let msi_transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(MSI_TIMEOUT)?);
    let endpoint = MsiEndpoint::from_env();
    if let Some(client_id) = &k.managed_identity_client_id {
        auth = auth.with_primary(Box::new(ManagedIdentityCredential::explicit(
            msi_transport.clone(),
            endpoint.clone(),
            client_id,
        )));
    }
    auth = auth.with_primary(Box::new(ManagedIdentityCredential::ambient(msi_transport, endpoint)));
    if let Some(cli) = &az {
        auth = auth.with_primary(Box::new(AzureCliCredential::new(cli.clone())));
    }

    let cache = match &k.account_cache {
        Some(path) => Some(AccountCache::new(path)),
        None => AccountCache::default_location(),
    };
    let settings = LegacySettings {
        authority: k.authority.clone(),
        client_id: k.device_client_id.clone(),
        tenant: k.tenant.clone().unwrap_or_else(|| "organizations".to_string()),
        account: k.account.clone(),
    };
    if let Some(cache) = &cache {
        auth = auth.with_legacy(Box::new(SilentCachedAccount::new(
            transport.clone(),
            cache.clone(),
            settings.clone(),
        )));
    }
    if let Some(cli) = az {
        auth = auth.with_legacy(Box::new(InteractiveBrowser::new(cli, console::user_attended())));
    }
    auth = auth.with_legacy(Box::new(DeviceCodeCredential::new(transport.clone(), cache, settings)));
    Ok(auth)
}

fn cmd_kusto(args: &CliArgs, k: &KustoArgs) -> Result<()> {
    if !k.cluster.starts_with("https://") {
        return Err(OpsError::config(format!("cluster '{}' must be an https:// URL", k.cluster)));
    }
    let csl = match (&k.query, &k.query_file) {
        (Some(query), _) => query.clone(),
        (None, Some(path)) => std::fs::read_to_string(path).with_path(path)?,
        (None, None) => return Err(OpsError::MissingParameter("query text or --query-file".into())),
    };
    if csl.trim().is_empty() {
        return Err(OpsError::InvalidArgument("query is empty".into()));
    }

    // leave the server room to answer before the client gives up
    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(k.timeout + Duration::from_secs(30))?);
    let auth = kusto_authenticator(k, &transport)?;
    let mut client = KustoClient::new(&k.cluster, transport, auth)
        .with_option("servertimeout", serde_json::json!(kusto_timespan(k.timeout)));

    let kind = CommandKind::detect(&csl);
    tracing::info!("Running {:?} command against {}/{}", kind, client.cluster(), k.database);
    let tables = client.execute(kind, &k.database, &csl)?;
    let shown = if k.all_tables { tables.len() } else { 1 };

    for mut table in tables.into_iter().take(shown) {
        if !k.keep_empty_columns {
            let removed = table.remove_empty_columns();
            if !removed.is_empty() {
                tracing::info!("Dropped empty column(s) from {}: {}", table.name, removed.join(", "));
            }
        }
        if !k.no_dedupe {
            table.dedupe_column_names();
        }
        if shown > 1 && args.output == OutputFormat::Text {
            println!("== {} ==", table.name);
        }
        emit(args.output, &table)?;
    }
    Ok(())
}

fn cmd_env(args: &CliArgs, action: &EnvCommand) -> Result<()> {
    let report: LoadReport = match action {
        EnvCommand::Load {
            file,
            override_existing,
        } => {
            if args.dry_run {
                load_env_file(file, &mut process_env_snapshot(), *override_existing)?
            } else {
                load_env_file(file, &mut ProcessEnv, *override_existing)?
            }
        }
        EnvCommand::Check { file } => load_env_file(file, &mut process_env_snapshot(), false)?,
    };
    emit(args.output, &report)
}

fn cmd_tags(args: &CliArgs, t: &TagsArgs) -> Result<()> {
    let scope = match (&t.resource_group, &t.resource_id) {
        (_, Some(id)) => TagScope::Resource(id.clone()),
        (Some(group), None) => TagScope::ResourceGroup(group.clone()),
        (None, None) => return Err(OpsError::MissingParameter("--resource-group or --resource-id".into())),
    };
    let api = AzTagsApi::new(az(args)?);
    let confirmer = default_confirmer(args.yes);

    let (requested, mode) = match &t.action {
        TagsCommand::Show => {
            let (id, current) = api.current(&scope)?;
            tracing::info!("{} tag(s) on '{}'", current.len(), id);
            return emit(args.output, &TagSet::from_map(current)?);
        }
        TagsCommand::Set { tags, replace } => {
            let mode = if *replace { TagMode::Replace } else { TagMode::Merge };
            (TagSet::from_pairs(tags)?, mode)
        }
        TagsCommand::Remove { keys } => (TagSet::from_pairs(keys)?, TagMode::Delete),
    };

    let plan = apply_tags(&api, confirmer.as_ref(), &scope, &requested, mode, args.dry_run)?;
    if plan.is_empty() {
        println!("No changes: tags already match");
        return Ok(());
    }
    emit(args.output, &plan)
}

fn cmd_storage(args: &CliArgs, action: &StorageCommand) -> Result<()> {
    let api = AzStorageApi::new(az(args)?);
    match action {
        StorageCommand::Accounts { resource_group } => {
            emit(args.output, &AccountTable(api.list_accounts(resource_group.as_deref())?))
        }
        StorageCommand::Containers { account } => emit(args.output, &ContainerTable(api.list_containers(account)?)),
        StorageCommand::Sas {
            account,
            container,
            permissions,
            expiry,
        } => {
            let request = SasRequest::new(account, container, permissions, *expiry, Utc::now())?;
            let confirmer = default_confirmer(args.yes);
            match issue_sas(&api, confirmer.as_ref(), &request, args.dry_run)? {
                Some(token) => println!("{}", token),
                None => println!("What if: generate {}", request),
            }
            Ok(())
        }
    }
}

fn cmd_ps(args: &CliArgs, ps: &PsArgs) -> Result<()> {
    let mut source = SysinfoSource::new();
    source.settle();
    let query = ProcessQuery {
        name: ps.name.clone(),
        sort: ps.sort,
        top: ps.top,
    };
    let records = query.apply(source.snapshot()?);
    emit(args.output, &ProcessTable(records))
}

fn cmd_watch_process(args: &CliArgs, watch: &WatchProcessArgs) -> Result<()> {
    let filter = ProcessQuery {
        name: watch.name.clone(),
        ..Default::default()
    };
    let mut watcher = ProcessWatcher::new(SysinfoSource::new(), filter);
    let tracked = watcher.prime()?;
    tracing::info!("Watching {} process(es), polling every {:?}", tracked, watch.interval);

    let stop = stop_on_interrupt()?;
    poll_loop(watch.interval, &stop, watch.count, || {
        for event in watcher.poll()? {
            let text = match &event {
                ProcessEvent::Started { pid, name, command } => format!("started {} {} {}", pid, name, command),
                ProcessEvent::Exited { pid, name } => format!("exited  {} {}", pid, name),
            };
            emit_event(args.output, &event, &text)?;
        }
        Ok(())
    })?;
    Ok(())
}

fn cmd_watch_port(args: &CliArgs, watch: &WatchPortArgs) -> Result<()> {
    let mut watcher = PortWatcher::new(TcpProbe::new(watch.timeout), watch.targets.clone());
    tracing::info!("Watching {} port(s), polling every {:?}", watch.targets.len(), watch.interval);

    let stop = stop_on_interrupt()?;
    poll_loop(watch.interval, &stop, watch.count, || {
        for transition in watcher.poll() {
            emit_event(args.output, &transition, &transition.to_string())?;
        }
        Ok(())
    })?;
    Ok(())
}

fn cmd_batch(args: &CliArgs, batch: &BatchArgs) -> Result<()> {
    let mut targets = match &batch.targets_file {
        Some(path) => load_targets(path)?,
        None => Vec::new(),
    };
    targets.extend(batch.target.iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()));
    let mut seen = HashSet::new();
    targets.retain(|t| seen.insert(t.clone()));
    if targets.is_empty() {
        return Err(OpsError::MissingParameter("at least one target".into()));
    }

    let template = CommandTemplate::new(batch.command.clone())?;
    if args.dry_run {
        for target in &targets {
            println!("What if: {}", template.render(target).join(" "));
        }
        return Ok(());
    }

    let total = targets.len() as u64;
    let progress = if args.quiet || !console::user_attended_stderr() {
        ProgressReporter::disabled(total)
    } else {
        ProgressReporter::new(total)
    };

    let report = BatchRunner::new(batch.throttle).run(&targets, |t| template.execute(t), Some(&progress))?;
    emit(args.output, &report)?;
    report.into_result().map(|_| ())
}
