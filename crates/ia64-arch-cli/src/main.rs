use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use ia64_arch::test_harness::FrameChainCursor;
use ia64_arch::{
    ArchCompileState, FunctionShape, IA64_REGISTER_FILE, MachineContext, OperandClass, RegBank,
    RegMask, WalkConfig, regs,
};

#[derive(Parser)]
#[command(name = "ia64-arch")]
#[command(about = "Inspect the IA-64 JIT register file, frame layouts and context walks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the register file descriptor
    Regs {
        #[arg(long, help = "Emit JSON instead of text")]
        json: bool,
    },
    /// Compute the register window and stack frame for a function shape
    Layout {
        #[arg(short, long, default_value_t = 0, help = "Number of declared parameters")]
        params: usize,

        #[arg(long, help = "Function takes an implicit `this` argument")]
        this: bool,

        #[arg(short, long, default_value_t = 0, help = "Values to keep in stacked registers")]
        locals: usize,

        #[arg(short, long, help = "Largest argument count at any call site (omit for leaf)")]
        max_out_args: Option<usize>,

        #[arg(long, help = "Function performs dynamic stack allocation")]
        localloc: bool,

        #[arg(long, help = "Function has exception clauses")]
        exceptions: bool,

        #[arg(long, default_value_t = 0, help = "Bytes of fixed stack locals")]
        locals_size: i32,

        #[arg(long, help = "Emit JSON instead of text")]
        json: bool,
    },
    /// Walk a synthetic frame chain, innermost frame first
    Walk {
        #[arg(required = true, help = "Frames as IP:SP, hex with 0x prefix or decimal")]
        frames: Vec<String>,

        #[arg(long, help = "Innermost IP is the faulting instruction")]
        precise: bool,

        #[arg(long, default_value_t = WalkConfig::default().max_steps)]
        max_steps: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Regs { json } => print_regs(json),
        Commands::Layout {
            params,
            this,
            locals,
            max_out_args,
            localloc,
            exceptions,
            locals_size,
            json,
        } => {
            let shape = FunctionShape {
                num_params: params,
                has_this: this,
                num_global_locals: locals,
                max_out_args,
                uses_localloc: localloc,
                has_exception_clauses: exceptions,
                locals_size,
                ..FunctionShape::default()
            };
            let state = ArchCompileState::new(&shape).context("Layout failed")?;
            print_layout(&state, json);
        }
        Commands::Walk {
            frames,
            precise,
            max_steps,
        } => walk(&frames, precise, max_steps)?,
    }

    Ok(())
}

fn reg_list(mask: RegMask, prefix: char) -> String {
    mask.iter()
        .map(|r| format!("{prefix}{r}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_regs(as_json: bool) {
    let rf = IA64_REGISTER_FILE;
    if as_json {
        let classes: Vec<_> = OperandClass::ALL
            .iter()
            .map(|class| {
                json!({
                    "tag": class.tag().to_string(),
                    "fixed_reg": regs::fixed_reg_for_tag(class.tag()),
                    "is_float": regs::is_float(*class),
                    "is_regpair": regs::is_regpair(*class),
                })
            })
            .collect();
        let doc = json!({
            "int_regs": rf.num_int_regs,
            "float_regs": rf.num_float_regs,
            "allocatable_int": format!("{:#x}", rf.allocatable(RegBank::Int).bits()),
            "allocatable_float": format!("{:#x}", rf.allocatable(RegBank::Float).bits()),
            "callee_saved_int": format!("{:#x}", rf.callee_saved(RegBank::Int).bits()),
            "callee_saved_float": format!("{:#x}", rf.callee_saved(RegBank::Float).bits()),
            "return_reg": rf.return_reg(RegBank::Int),
            "float_return_reg": rf.return_reg(RegBank::Float),
            "classes": classes,
        });
        println!("{doc:#}");
        return;
    }

    println!("integer registers:  {}", rf.num_int_regs);
    println!("float registers:    {}", rf.num_float_regs);
    println!("allocatable int:    {}", reg_list(rf.allocatable_int, 'r'));
    println!("allocatable float:  {}", reg_list(rf.allocatable_float, 'f'));
    println!(
        "callee-saved int:   {} registers",
        rf.callee_saved_int.count()
    );
    println!(
        "callee-saved float: {} registers",
        rf.callee_saved_float.count()
    );
    println!("return registers:   r{} f{}", rf.int_return_reg, rf.float_return_reg);
    for class in OperandClass::ALL {
        println!(
            "class '{}': fixed {:>2}, float {}",
            class.tag(),
            regs::fixed_reg_for_tag(class.tag()),
            regs::is_float(class)
        );
    }
}

fn print_layout(state: &ArchCompileState, as_json: bool) {
    let p = state.partition;
    let s = state.saved;
    if as_json {
        let doc = json!({
            "reg_in0": p.reg_in0,
            "reg_local0": p.reg_local0,
            "reg_out0": p.reg_out0,
            "n_out_regs": p.n_out_regs,
            "size_of_frame": p.size_of_frame(),
            "saved": {
                "ar_pfs": s.ar_pfs,
                "b0": s.b0,
                "sp": s.sp,
                "fp": s.fp,
                "return_val": s.return_val,
            },
            "omit_fp": state.omit_fp,
            "stack_alloc_size": state.stack_alloc_size(),
            "localloc_offset": state.localloc_offset(),
            "lmf_offset": state.frame.lmf_offset,
        });
        println!("{doc:#}");
        return;
    }

    println!(
        "window:  in r{}..r{}  local r{}..r{}  out r{}..r{}",
        p.reg_in0,
        p.reg_local0,
        p.reg_local0,
        p.reg_out0,
        p.reg_out0,
        u16::from(p.reg_out0) + u16::from(p.n_out_regs)
    );
    let show = |reg: Option<u8>| reg.map_or_else(|| "-".to_string(), |r| format!("r{r}"));
    println!(
        "saved:   ar.pfs {}  b0 {}  sp {}  fp {}",
        show(s.ar_pfs),
        show(s.b0),
        show(s.sp),
        show(s.fp)
    );
    println!(
        "frame:   {} bytes, localloc at +{}, fp {}",
        state.stack_alloc_size(),
        state.localloc_offset(),
        if state.omit_fp { "omitted" } else { "kept" }
    );
}

fn parse_word(text: &str) -> Result<u64> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("invalid address '{text}'"))
}

fn walk(frames: &[String], precise: bool, max_steps: usize) -> Result<()> {
    let pairs = frames
        .iter()
        .map(|frame| {
            let (ip, sp) = frame
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("invalid frame '{frame}', expected IP:SP"))?;
            Ok((parse_word(ip)?, parse_word(sp)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let cursor = FrameChainCursor::from_pairs(&pairs);
    let ctx = if precise {
        MachineContext::from_signal(cursor)
    } else {
        MachineContext::from_unwound(cursor)
    };

    for (depth, frame) in ctx.walk(WalkConfig { max_steps }).enumerate() {
        let frame = frame.context("Frame walk failed")?;
        let fp = frame
            .fp()
            .map_or_else(|_| "-".to_string(), |fp| format!("{fp:#x}"));
        println!(
            "#{depth:<3} ip {:#018x}  sp {:#018x}  fp {fp}",
            frame.ip()?,
            frame.sp()?
        );
    }
    Ok(())
}
