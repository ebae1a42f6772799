use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};

use limitctl_raw::mchbar;
use limitctl_raw::rapl::{self, units_to_watts, watts_to_units, PackagePowerLimit};
use limitctl_raw::RegisterLayout;

use limitctl::protocol::{self, Request};
use limitctl::workflow::{
    self, ApplyTarget, LimitRequest, PowerLimitAccess, RegisterTarget, SyncDirection,
};
use limitctl::{PowerSession, Profile, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "limitctl")]
#[command(about = "Inspect and override Intel package power limits (MSR 0x610 + MCHBAR 0x59A0)")]
struct Args {
    #[arg(
        short,
        long,
        help = "Enable verbose logging (shows all register read/write operations)"
    )]
    verbose: bool,

    #[arg(
        long,
        default_value_t = 0,
        help = "Logical CPU whose MSR interface is used (package registers read the same from any CPU of the package)"
    )]
    cpu: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the current limits from both registers
    Show,

    /// Set PL1/PL2 limits in watts
    Set {
        #[arg(long, help = "Sustained (PL1) limit in watts")]
        pl1: f64,

        #[arg(long, help = "Short-term (PL2) limit in watts")]
        pl2: f64,

        #[arg(long, value_enum, default_value = "both", help = "Register(s) to write")]
        target: TargetArg,

        #[arg(long, help = "Also mirror the limits into the kernel powercap layer")]
        powercap: bool,

        #[arg(short, long, help = "Skip confirmation prompts")]
        yes: bool,
    },

    /// Copy one register's raw value verbatim into the other
    Sync {
        #[arg(value_enum)]
        direction: DirectionArg,

        #[arg(short, long, help = "Skip confirmation prompts")]
        yes: bool,
    },

    /// Write a raw 64-bit value to one register (restore a saved value)
    Restore {
        #[arg(value_enum)]
        target: RegisterArg,

        #[arg(value_name = "HEX64")]
        value: String,

        #[arg(short, long, help = "Skip confirmation prompts")]
        yes: bool,
    },

    /// Scan the MCHBAR window for power-limit-shaped values
    Scan {
        #[arg(long, default_value_t = 55.0, help = "PL1 watts to look for")]
        pl1: f64,

        #[arg(long, default_value_t = 157.0, help = "PL2 watts to look for")]
        pl2: f64,

        #[arg(
            long,
            value_name = "UNITS",
            help = "Match raw PL1 units (decimal or 0x hex) instead of converting watts"
        )]
        pl1_units: Option<String>,

        #[arg(
            long,
            value_name = "UNITS",
            help = "Match raw PL2 units (decimal or 0x hex) instead of converting watts"
        )]
        pl2_units: Option<String>,

        #[arg(long, help = "Also match values whose enable bits are clear")]
        any: bool,
    },

    /// Apply a profile's limits without prompting (startup use)
    ApplyProfile {
        path: PathBuf,

        #[arg(long, value_enum, default_value = "both", help = "Register(s) to write")]
        target: TargetArg,

        #[arg(long, help = "Also mirror the limits into the kernel powercap layer")]
        powercap: bool,
    },

    /// Execute one line-protocol request (privileged helper mode)
    Helper {
        #[arg(long, help = "Answer with the current state as KEY=VALUE lines")]
        read: bool,

        #[arg(long, value_name = "HEX64", help = "Write a raw value to the MSR register")]
        write_msr: Option<String>,

        #[arg(long, value_name = "HEX64", help = "Write a raw value to the MMIO register")]
        write_mmio: Option<String>,

        #[arg(
            long,
            num_args = 2,
            value_names = ["PL1_UW", "PL2_UW"],
            help = "Write both kernel powercap constraints in microwatts"
        )]
        write_powercap: Option<Vec<u64>>,

        #[arg(long, value_name = "LINE", help = "Execute a raw protocol request line")]
        request: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TargetArg {
    Msr,
    Mmio,
    Both,
}

impl From<TargetArg> for ApplyTarget {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Msr => ApplyTarget::Msr,
            TargetArg::Mmio => ApplyTarget::Mmio,
            TargetArg::Both => ApplyTarget::Both,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RegisterArg {
    Msr,
    Mmio,
}

impl From<RegisterArg> for RegisterTarget {
    fn from(arg: RegisterArg) -> Self {
        match arg {
            RegisterArg::Msr => RegisterTarget::Msr,
            RegisterArg::Mmio => RegisterTarget::Mmio,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DirectionArg {
    MsrToMmio,
    MmioToMsr,
}

impl From<DirectionArg> for SyncDirection {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::MsrToMmio => SyncDirection::MsrToMmio,
            DirectionArg::MmioToMsr => SyncDirection::MmioToMsr,
        }
    }
}

fn check_permissions() {
    let msr_path = "/dev/cpu/0/msr";
    if std::fs::metadata(msr_path).is_err() {
        eprintln!(
            "\nERROR: Cannot access {msr_path}\n\nThe msr kernel module may not be loaded.\nRun: sudo modprobe msr\n"
        );
        std::process::exit(1);
    }

    if let Err(e) = std::fs::File::open(msr_path) {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            eprintln!(
                "\nERROR: Permission denied accessing {msr_path}\n\nRun limitctl as root; the MSR and /dev/mem interfaces are privileged.\n"
            );
            std::process::exit(1);
        }
    }
}

fn confirm(label: &str) -> anyhow::Result<bool> {
    print!("{label} [y/N]: ");
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim_start().chars().next(), Some('y' | 'Y')))
}

fn print_register(label: &str, raw: u64, unit_watts: f64) {
    let view = PackagePowerLimit::from_raw(raw);
    println!("{label}");
    println!("  raw = {raw:#018x}");
    println!(
        "  PL1 = {} ({:.2} W){}",
        view.pl1_units,
        units_to_watts(view.pl1_units, unit_watts),
        if view.pl1_enabled { "" } else { " [disabled]" }
    );
    println!(
        "  PL2 = {} ({:.2} W){}",
        view.pl2_units,
        units_to_watts(view.pl2_units, unit_watts),
        if view.pl2_enabled { "" } else { " [disabled]" }
    );
}

fn cmd_show(session: &PowerSession) -> anyhow::Result<()> {
    println!(
        "Power unit: 2^-{} W = {:.6} W\n",
        session.power_unit(),
        session.unit_watts()
    );

    let inspection = workflow::inspect(session);

    match inspection.msr {
        Ok(raw) => print_register("MSR  IA32_PKG_POWER_LIMIT (0x610)", raw, session.unit_watts()),
        Err(e) => println!("MSR  IA32_PKG_POWER_LIMIT (0x610)\n  read failed: {e}"),
    }
    match inspection.mmio {
        Ok(raw) => print_register("MMIO MCHBAR PL (0x59A0)", raw, session.unit_watts()),
        Err(e) => println!("MMIO MCHBAR PL (0x59A0)\n  read failed: {e}"),
    }

    Ok(())
}

fn cmd_set(
    session: &PowerSession,
    pl1: f64,
    pl2: f64,
    target: ApplyTarget,
    powercap: bool,
    assume_yes: bool,
) -> anyhow::Result<()> {
    let state = session.read_state()?;
    let request = LimitRequest {
        pl1_watts: pl1,
        pl2_watts: pl2,
        target,
        powercap,
    };
    let mut plan = workflow::plan_limits(&state, &request)?;

    println!(
        "PL1 = {pl1} W -> {} units, PL2 = {pl2} W -> {} units",
        plan.pl1_units, plan.pl2_units
    );

    if let Some(next) = plan.msr_next {
        println!(
            "MSR  ({:#x}) new = {next:#018x}",
            rapl::msr::MSR_PKG_POWER_LIMIT
        );
        if !assume_yes && !confirm("Write MSR?")? {
            plan.msr_next = None;
        }
    }
    if let Some(next) = plan.mmio_next {
        println!("MMIO (+{:#06x}) new = {next:#018x}", mchbar::PL_OFFSET);
        if !assume_yes && !confirm("Write MMIO?")? {
            plan.mmio_next = None;
        }
    }
    if let Some((pl1_uw, pl2_uw)) = plan.powercap_uw {
        println!("powercap PL1 = {pl1_uw} uW, PL2 = {pl2_uw} uW");
        if !assume_yes && !confirm("Write kernel powercap?")? {
            plan.powercap_uw = None;
        }
    }

    let report = workflow::execute_plan(session, &plan);
    print_report(&report)
}

fn print_report(report: &workflow::ApplyReport) -> anyhow::Result<()> {
    if let Some(outcome) = &report.msr {
        match outcome {
            Ok(value) => println!("MSR  write ok   {value:#018x}"),
            Err(e) => println!("MSR  write FAILED: {e}"),
        }
    }
    if let Some(outcome) = &report.mmio {
        match outcome {
            Ok(value) => println!("MMIO write ok   {value:#018x}"),
            Err(e) => println!("MMIO write FAILED: {e}"),
        }
    }
    if let Some(outcome) = &report.powercap {
        match outcome {
            Ok((pl1_uw, pl2_uw)) => println!("powercap write ok   {pl1_uw}/{pl2_uw} uW"),
            Err(e) => println!("powercap write FAILED: {e}"),
        }
    }

    if report.fully_applied() {
        Ok(())
    } else {
        anyhow::bail!("one or more writes failed; targets reported above");
    }
}

fn cmd_sync(session: &PowerSession, direction: SyncDirection, assume_yes: bool) -> anyhow::Result<()> {
    let raw = workflow::plan_sync(session, direction)?;
    println!("{} <- {raw:#018x}", direction.destination());

    if !assume_yes && !confirm(&format!("Write {}?", direction.destination()))? {
        println!("Canceled.");
        return Ok(());
    }

    workflow::execute_sync(session, direction, raw)?;
    println!("{} write ok   {raw:#018x}", direction.destination());
    Ok(())
}

fn cmd_restore(
    session: &PowerSession,
    target: RegisterTarget,
    value: &str,
    assume_yes: bool,
) -> anyhow::Result<()> {
    let value = protocol::parse_hex_u64(value)?;
    let orig = session.read_register(target)?;

    println!("{target} current = {orig:#018x}");
    println!("{target} new     = {value:#018x}");

    if !assume_yes && !confirm(&format!("Write {target}?"))? {
        println!("Canceled.");
        return Ok(());
    }

    session.write_register(target, value)?;
    println!("Restore the previous value with:\n  limitctl restore {} {orig:#018x}", match target {
        RegisterTarget::Msr => "msr",
        RegisterTarget::Mmio => "mmio",
    });
    Ok(())
}

fn parse_units_arg(text: &str) -> anyhow::Result<u16> {
    let units = protocol::parse_u64_auto(text)
        .with_context(|| format!("bad units value {text:?}"))?;
    if units > 0x7FFF {
        anyhow::bail!("units value {units:#x} exceeds the 15-bit field");
    }
    Ok(units as u16)
}

fn cmd_scan(
    session: &PowerSession,
    pl1: f64,
    pl2: f64,
    pl1_units: Option<&str>,
    pl2_units: Option<&str>,
    any: bool,
) -> anyhow::Result<()> {
    let (pl1_units, pl2_units) = match (pl1_units, pl2_units) {
        (Some(a), Some(b)) => (parse_units_arg(a)?, parse_units_arg(b)?),
        (None, None) => (
            watts_to_units(pl1, session.unit_watts())?,
            watts_to_units(pl2, session.unit_watts())?,
        ),
        _ => anyhow::bail!("--pl1-units and --pl2-units must be given together"),
    };

    println!(
        "Scanning MCHBAR window for PL1 units {pl1_units:#x}, PL2 units {pl2_units:#x} (require_enable={})",
        !any
    );

    let matches = limitctl::scan::scan_window(session.mmio(), pl1_units, pl2_units, !any)?;
    for found in &matches {
        println!("match off={:#07x} val={:#018x}", found.offset, found.value);
    }
    if matches.is_empty() {
        println!("No matches found.");
    }
    Ok(())
}

fn cmd_apply_profile(
    session: &PowerSession,
    path: &std::path::Path,
    target: ApplyTarget,
    powercap: bool,
) -> anyhow::Result<()> {
    let profile = Profile::load(path)?;

    println!(
        "Profile {}: PL1 = {} W, PL2 = {} W, P ratio = {}, E ratio = {}",
        path.display(),
        profile.pl1_w,
        profile.pl2_w,
        profile.p_ratio,
        profile.e_ratio
    );
    if profile.core_uv_needs_report() {
        println!(
            "Core offset: requested {} mV, hardware step gives {:.4} mV",
            profile.core_uv_mv,
            profile.quantized_core_uv_mv()
        );
    } else {
        println!("Core offset: {} mV", profile.core_uv_mv);
    }

    let state = session.read_state()?;
    let request = LimitRequest {
        pl1_watts: profile.pl1_w,
        pl2_watts: profile.pl2_w,
        target,
        powercap,
    };
    let plan = workflow::plan_limits(&state, &request)?;
    let report = workflow::execute_plan(session, &plan);
    print_report(&report)
}

fn cmd_helper(
    session: &PowerSession,
    read: bool,
    write_msr: Option<&str>,
    write_mmio: Option<&str>,
    write_powercap: Option<&[u64]>,
    request_line: Option<&str>,
) -> anyhow::Result<()> {
    let mut requests = Vec::new();

    if read {
        requests.push(Request::ReadState);
    }
    if let Some(value) = write_msr {
        requests.push(Request::WriteRegister {
            target: RegisterTarget::Msr,
            value: protocol::parse_hex_u64(value)?,
        });
    }
    if let Some(value) = write_mmio {
        requests.push(Request::WriteRegister {
            target: RegisterTarget::Mmio,
            value: protocol::parse_hex_u64(value)?,
        });
    }
    if let Some(values) = write_powercap {
        requests.push(Request::WritePowercap {
            pl1_uw: values[0],
            pl2_uw: values[1],
        });
    }
    if let Some(line) = request_line {
        requests.push(Request::parse_line(line)?);
    }

    if requests.len() != 1 {
        anyhow::bail!("helper mode takes exactly one request");
    }

    if let Some(body) = protocol::serve_request(session, &requests[0])? {
        print!("{body}");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup logging based on verbose flag
    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    // Check for root/capabilities early
    check_permissions();

    let config = SessionConfig::with_cpu(args.cpu);
    let session = PowerSession::open(&config).context("open power session")?;

    match args.command {
        Command::Show => cmd_show(&session),
        Command::Set {
            pl1,
            pl2,
            target,
            powercap,
            yes,
        } => cmd_set(&session, pl1, pl2, target.into(), powercap, yes),
        Command::Sync { direction, yes } => cmd_sync(&session, direction.into(), yes),
        Command::Restore { target, value, yes } => {
            cmd_restore(&session, target.into(), &value, yes)
        }
        Command::Scan {
            pl1,
            pl2,
            pl1_units,
            pl2_units,
            any,
        } => cmd_scan(
            &session,
            pl1,
            pl2,
            pl1_units.as_deref(),
            pl2_units.as_deref(),
            any,
        ),
        Command::ApplyProfile {
            path,
            target,
            powercap,
        } => cmd_apply_profile(&session, &path, target.into(), powercap),
        Command::Helper {
            read,
            write_msr,
            write_mmio,
            write_powercap,
            request,
        } => cmd_helper(
            &session,
            read,
            write_msr.as_deref(),
            write_mmio.as_deref(),
            write_powercap.as_deref(),
            request.as_deref(),
        ),
    }
}
