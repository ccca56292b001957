mod aggregate;
mod chart;
mod config;
mod dashboard;
mod fetch;
mod logging;
mod prefs;
mod query;
mod render;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use num_format::Locale;
use serde::Serialize;

use crate::{
    aggregate::{Aggregator, DEFAULT_QUOTA_PER_UNIT},
    chart::{BarSpec, PieSpec},
    config::{DefaultsConfig, ServerConfig, load_config, resolve, resolve_bool},
    dashboard::DashboardContext,
    fetch::{ApiClient, DashboardUser, ReplaySource, UsageSource},
    logging::LogSink,
    prefs::Preferences,
    query::{
        Granularity, Preset, QueryFilter, UsageRequest, build_request, format_datetime,
        parse_datetime,
    },
    render::{
        QuotaDisplay, SimpleTable, locale_to_string, print_bar_chart, print_pie_chart,
        resolve_locale,
    },
};

const URL_ENV: &str = "USAGE_BOARD_URL";
const TOKEN_ENV: &str = "USAGE_BOARD_TOKEN";
const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Parser, Debug)]
#[command(name = "usage-board", about = "Query and chart One API model usage")]
struct Cli {
    /// Gateway base URL. Falls back to USAGE_BOARD_URL, then server.base_url in the config
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Access token sent as a bearer token. Falls back to USAGE_BOARD_TOKEN
    #[arg(long, global = true)]
    token: Option<String>,

    /// Query the site-wide endpoint as an administrator (enables --user)
    #[arg(long, global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    admin: Option<bool>,

    /// Optional config file (JSON). If omitted, tries ./usage-board.json then ~/.config/usage-board/config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Timezone (IANA name, e.g. UTC, Asia/Shanghai)
    #[arg(long, global = true)]
    timezone: Option<String>,

    /// Locale for number formatting (e.g. en, fr, de). Falls back to en.
    #[arg(long, global = true)]
    locale: Option<String>,

    /// Output JSON instead of tables (can be passed as --json or --json=false)
    #[arg(long, global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    json: Option<bool>,

    /// Quota units per currency unit (default 500000)
    #[arg(long, global = true)]
    quota_per_unit: Option<f64>,

    /// Show usage as currency (--currency=false shows raw quota)
    #[arg(long, global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    currency: Option<bool>,

    /// Answer queries from saved gateway responses (data.json, users.json) in this directory
    #[arg(long, global = true)]
    replay: Option<PathBuf>,

    /// More logging (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Default: query once and print both charts
    Report(FilterArgs),
    /// Interactive dashboard with filter controls
    Dashboard(FilterArgs),
    /// List the user directory (administrators only)
    Users,
    /// Show the request a query would send, without sending it
    Request(FilterArgs),
    /// Show or change the stored default granularity
    Prefs(PrefsArgs),
}

#[derive(Args, Debug, Clone, Default)]
struct FilterArgs {
    /// Range start (YYYY-MM-DD, YYYY-MM-DD HH:MM[:SS] or RFC 3339, in the selected timezone)
    #[arg(long)]
    start: Option<String>,

    /// Range end (same formats as --start)
    #[arg(long)]
    end: Option<String>,

    /// Bucket width for the usage chart
    #[arg(long, value_enum)]
    granularity: Option<Granularity>,

    /// Username to query; empty means all users. Ignored without --admin
    #[arg(long)]
    user: Option<String>,

    /// Quick range ending today at 23:59:59
    #[arg(long, value_enum, conflicts_with_all = ["start", "end"])]
    preset: Option<Preset>,

    /// Pin the current time (RFC 3339)
    #[arg(long, hide = true)]
    now: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
struct PrefsArgs {
    /// Store a default granularity
    #[arg(long, value_enum, conflicts_with = "clear")]
    granularity: Option<Granularity>,

    /// Forget the stored default granularity
    #[arg(long)]
    clear: bool,
}

struct Settings {
    tz: Tz,
    locale: Locale,
    json: bool,
    is_admin: bool,
    display: QuotaDisplay,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let file_cfg = load_config(cli.config.as_ref())?;

    let global_defaults = file_cfg.defaults.as_ref();
    let server = file_cfg.server.as_ref();
    let commands = file_cfg.commands.as_ref();

    let cmd = cli
        .command
        .clone()
        .unwrap_or(Command::Report(FilterArgs::default()));
    let cmd_cfg = match &cmd {
        Command::Report(_) => commands.and_then(|c| c.report.as_ref()),
        Command::Dashboard(_) => commands.and_then(|c| c.dashboard.as_ref()),
        Command::Request(_) => commands.and_then(|c| c.request.as_ref()),
        Command::Users | Command::Prefs(_) => None,
    };

    let level = logging::default_level(
        cli.verbose,
        resolve(
            None,
            cmd_cfg.and_then(|c| c.log_level.as_ref()),
            global_defaults.and_then(|d| d.log_level.as_ref()),
        )
        .as_deref(),
    );
    // The dashboard owns the terminal, so its logs go to a file.
    match &cmd {
        Command::Dashboard(_) => {
            logging::init(&level, LogSink::File(&logging::dashboard_log_path()))?
        }
        _ => logging::init(&level, LogSink::Stderr)?,
    }

    let settings = resolve_settings(&cli, cmd_cfg, global_defaults, server)?;
    let prefs_path = prefs::preferences_path();
    let preferences = prefs::load(prefs_path.as_deref());

    match cmd {
        Command::Report(args) => {
            let now = resolve_now(args.now.as_deref())?;
            let filter = resolve_filter(&args, cmd_cfg, global_defaults, &settings, &preferences, now)?;
            let source = build_source(&cli, server)?;
            run_report(source.as_ref(), &filter, &settings, base_url(&cli, server), now)?;
        }
        Command::Dashboard(args) => {
            let now = resolve_now(args.now.as_deref())?;
            let filter = resolve_filter(&args, cmd_cfg, global_defaults, &settings, &preferences, now)?;
            let source = build_source(&cli, server)?;
            dashboard::run(DashboardContext {
                source,
                tz: settings.tz,
                locale: settings.locale,
                is_admin: settings.is_admin,
                display: settings.display,
                filter,
            })?;
        }
        Command::Users => {
            if !settings.is_admin {
                bail!("The user directory is only available to administrators (pass --admin)");
            }
            let source = build_source(&cli, server)?;
            let users = source.users().context("Failed to load the user directory")?;
            output_users(&users, settings.json);
        }
        Command::Request(args) => {
            let now = resolve_now(args.now.as_deref())?;
            let filter = resolve_filter(&args, cmd_cfg, global_defaults, &settings, &preferences, now)?;
            let request = build_request(&filter, settings.is_admin);
            let view = RequestView::new(&request, base_url(&cli, server).as_deref())?;
            output_request(&view, &filter, settings.json)?;
        }
        Command::Prefs(args) => {
            let path = prefs_path.ok_or_else(|| {
                anyhow!("Could not determine where to store preferences; set {}", prefs::PREFS_ENV)
            })?;
            let mut current = preferences;
            if args.clear || args.granularity.is_some() {
                current.default_granularity = args.granularity;
                prefs::save(&path, &current)?;
                tracing::info!(path = %path.display(), "preferences saved");
            }
            output_prefs(&path, &current, settings.json)?;
        }
    }

    Ok(())
}

fn resolve_settings(
    cli: &Cli,
    cmd: Option<&DefaultsConfig>,
    defaults: Option<&DefaultsConfig>,
    server: Option<&ServerConfig>,
) -> Result<Settings> {
    let tz_raw = resolve(
        cli.timezone.as_ref(),
        cmd.and_then(|c| c.timezone.as_ref()),
        defaults.and_then(|d| d.timezone.as_ref()),
    );
    let locale_raw = resolve(
        cli.locale.as_ref(),
        cmd.and_then(|c| c.locale.as_ref()),
        defaults.and_then(|d| d.locale.as_ref()),
    );
    let quota_per_unit = resolve(
        cli.quota_per_unit.as_ref(),
        cmd.and_then(|c| c.quota_per_unit.as_ref()),
        defaults.and_then(|d| d.quota_per_unit.as_ref()),
    )
    .filter(|q| *q > 0.0)
    .unwrap_or(DEFAULT_QUOTA_PER_UNIT);

    Ok(Settings {
        tz: parse_timezone(tz_raw)?,
        locale: resolve_locale(locale_raw.as_deref()),
        json: resolve_bool(
            cli.json,
            cmd.and_then(|c| c.json),
            defaults.and_then(|d| d.json),
            false,
        ),
        is_admin: resolve_bool(cli.admin, None, server.and_then(|s| s.admin), false),
        display: QuotaDisplay {
            quota_per_unit,
            in_currency: resolve_bool(
                cli.currency,
                cmd.and_then(|c| c.display_in_currency),
                defaults.and_then(|d| d.display_in_currency),
                true,
            ),
        },
    })
}

fn resolve_filter(
    args: &FilterArgs,
    cmd: Option<&DefaultsConfig>,
    defaults: Option<&DefaultsConfig>,
    settings: &Settings,
    preferences: &Preferences,
    now: DateTime<Utc>,
) -> Result<QueryFilter> {
    let tz = &settings.tz;
    let mut filter = QueryFilter::initial(now, tz, preferences.default_granularity);

    if let Some(granularity) = resolve(
        args.granularity.as_ref(),
        cmd.and_then(|c| c.granularity.as_ref()),
        defaults.and_then(|d| d.granularity.as_ref()),
    ) {
        filter.granularity = granularity;
    }
    filter.username = resolve(
        args.user.as_ref(),
        cmd.and_then(|c| c.user.as_ref()),
        defaults.and_then(|d| d.user.as_ref()),
    );
    if args.user.is_some() && !settings.is_admin {
        tracing::warn!("--user only applies to administrator queries; querying your own usage");
    }

    if let Some(preset) = args.preset {
        filter.apply_preset(preset, now, tz)?;
    }
    if let Some(raw) = &args.start {
        filter.start = parse_datetime(raw, tz).context("Invalid --start")?;
    }
    if let Some(raw) = &args.end {
        filter.end = parse_datetime(raw, tz).context("Invalid --end")?;
    }
    Ok(filter)
}

fn resolve_now(raw: Option<&str>) -> Result<DateTime<Utc>> {
    match raw {
        Some(raw) => Ok(DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("Invalid --now '{raw}', expected RFC 3339"))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

fn base_url(cli: &Cli, server: Option<&ServerConfig>) -> Option<String> {
    cli.base_url
        .clone()
        .or_else(|| std::env::var(URL_ENV).ok().filter(|v| !v.is_empty()))
        .or_else(|| server.and_then(|s| s.base_url.clone()))
}

fn build_source(cli: &Cli, server: Option<&ServerConfig>) -> Result<Arc<dyn UsageSource>> {
    if let Some(dir) = &cli.replay {
        tracing::info!(dir = %dir.display(), "answering queries from replay directory");
        return Ok(Arc::new(ReplaySource::new(dir)));
    }
    let base_url = base_url(cli, server).ok_or_else(|| {
        anyhow!(
            "No gateway URL configured. Pass --base-url, set {URL_ENV} or add server.base_url to the config file"
        )
    })?;
    let token = cli
        .token
        .clone()
        .or_else(|| std::env::var(TOKEN_ENV).ok().filter(|v| !v.is_empty()))
        .or_else(|| server.and_then(|s| s.access_token.clone()));
    let timeout = server
        .and_then(|s| s.timeout_seconds)
        .unwrap_or(DEFAULT_TIMEOUT_SECONDS);
    Ok(Arc::new(ApiClient::new(
        base_url,
        token,
        Duration::from_secs(timeout),
    )))
}

fn parse_timezone(raw: Option<String>) -> Result<Tz> {
    let tz_str = raw.unwrap_or_else(|| "UTC".to_string());
    tz_str.parse::<Tz>().map_err(|e| {
        anyhow!(
            "Invalid timezone '{}': {}. Example: 'UTC' or 'Asia/Shanghai'",
            tz_str,
            e
        )
    })
}

#[derive(Serialize)]
struct RequestView<'a> {
    scope: &'static str,
    username: Option<&'a str>,
    path: &'static str,
    url: Option<String>,
    start_timestamp: i64,
    end_timestamp: i64,
    default_time: Granularity,
}

impl<'a> RequestView<'a> {
    fn new(request: &'a UsageRequest, base_url: Option<&str>) -> Result<Self> {
        let url = match base_url {
            Some(base) => Some(
                request
                    .url(base)
                    .with_context(|| format!("Invalid gateway URL '{base}'"))?
                    .to_string(),
            ),
            None => None,
        };
        Ok(RequestView {
            scope: request.scope(),
            username: request.username(),
            path: request.path(),
            url,
            start_timestamp: request.start_timestamp,
            end_timestamp: request.end_timestamp,
            default_time: request.granularity,
        })
    }
}

#[derive(Serialize)]
struct Totals {
    times: u64,
    consume_quota: f64,
    usage: f64,
    placeholder: bool,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    kind: &'static str,
    timezone: String,
    locale: String,
    granularity: Granularity,
    request: RequestView<'a>,
    totals: Totals,
    bar: &'a BarSpec,
    pie: &'a PieSpec,
}

fn run_report(
    source: &dyn UsageSource,
    filter: &QueryFilter,
    settings: &Settings,
    base_url: Option<String>,
    now: DateTime<Utc>,
) -> Result<()> {
    let request = build_request(filter, settings.is_admin);
    let records = source.usage(&request).context("Usage query failed")?;
    let agg = Aggregator::new(filter.granularity, &settings.tz, settings.display.quota_per_unit)
        .aggregate(&records, now);
    let bar = BarSpec::from_aggregation(&agg, &settings.display);
    let pie = PieSpec::from_aggregation(&agg);

    if settings.json {
        let report = JsonReport {
            kind: "report",
            timezone: settings.tz.name().to_string(),
            locale: locale_to_string(&settings.locale),
            granularity: agg.granularity,
            request: RequestView::new(&request, base_url.as_deref())?,
            totals: Totals {
                times: agg.times,
                consume_quota: agg.consume_quota,
                usage: agg.usage_total,
                placeholder: agg.placeholder,
            },
            bar: &bar,
            pie: &pie,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let who = match request.username() {
        None => "own usage".to_string(),
        Some("") => "all users".to_string(),
        Some(name) => format!("user {name}"),
    };
    println!(
        "{} {} to {} ({}, {}, {})",
        "Usage".bold(),
        format_datetime(&filter.start),
        format_datetime(&filter.end),
        settings.tz.name(),
        filter.granularity.as_str(),
        who
    );
    if agg.placeholder {
        println!("{}", "No usage recorded in this range".dimmed());
    }
    println!();
    print_bar_chart(&bar, &settings.display);
    println!();
    print_pie_chart(&pie, &settings.locale);
    Ok(())
}

fn output_users(users: &[DashboardUser], json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({ "kind": "users", "users": users })
        );
        return;
    }
    let mut table =
        SimpleTable::new(vec!["ID", "Username", "Display name"]).header_style(|s| s.cyan().bold());
    for user in users {
        let username = if user.is_all_users() {
            "(all users)".dimmed().to_string()
        } else {
            user.username.clone()
        };
        table.add_row(vec![user.id.to_string(), username, user.display_name.clone()]);
    }
    table.print();
}

fn output_request(view: &RequestView<'_>, filter: &QueryFilter, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "kind": "request", "request": view }))?
        );
        return Ok(());
    }
    let mut table = SimpleTable::new(vec!["Field", "Value"]).header_style(|s| s.cyan().bold());
    table.add_row(vec!["scope".into(), view.scope.into()]);
    if let Some(username) = view.username {
        table.add_row(vec!["username".into(), username.into()]);
    }
    table.add_row(vec!["path".into(), view.path.into()]);
    table.add_row(vec![
        "start_timestamp".into(),
        format!("{} ({})", view.start_timestamp, format_datetime(&filter.start)),
    ]);
    table.add_row(vec![
        "end_timestamp".into(),
        format!("{} ({})", view.end_timestamp, format_datetime(&filter.end)),
    ]);
    table.add_row(vec!["default_time".into(), view.default_time.as_str().into()]);
    if let Some(url) = &view.url {
        table.add_row(vec!["url".into(), url.clone()]);
    }
    table.print();
    Ok(())
}

fn output_prefs(path: &std::path::Path, prefs: &Preferences, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "kind": "prefs",
                "path": path.display().to_string(),
                "default_granularity": prefs.default_granularity,
            }))?
        );
        return Ok(());
    }
    let value = match prefs.default_granularity {
        Some(g) => g.as_str().to_string(),
        None => "unset (hour, 7 day lookback)".dimmed().to_string(),
    };
    println!("{} {}", "Default granularity:".bold(), value);
    println!("{} {}", "Stored in:".bold(), path.display());
    Ok(())
}
