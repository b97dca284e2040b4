use std::{fs, path::PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use env_logger::Env;
use log::debug;
use wasmkit::{
    Config, Imports, Module, Runtime, SharedModule, Value,
    binary::types::{ExportDesc, ImportDesc, ValueType},
};

fn cli() -> Command {
    Command::new("wasmkit")
        .about("Runs an exported function of a WebAssembly module")
        .allow_negative_numbers(true)
        .arg(
            Arg::new("path")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(Arg::new("export").required_unless_present("dump"))
        .arg(Arg::new("args").num_args(0..).trailing_var_arg(true))
        .arg(
            Arg::new("no-compile")
                .long("no-compile")
                .action(ArgAction::SetTrue)
                .help("Interpret every call instead of compiling"),
        )
        .arg(
            Arg::new("fuel")
                .long("fuel")
                .value_parser(value_parser!(u64))
                .help("Loop back-edges allowed before trapping"),
        )
        .arg(
            Arg::new("max-call-depth")
                .long("max-call-depth")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("dump")
                .long("dump")
                .action(ArgAction::SetTrue)
                .help("Print a summary of the module"),
        )
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    run(cli().get_matches())
}

fn run(matches: ArgMatches) -> Result<()> {
    let Some(path) = matches.get_one::<PathBuf>("path") else {
        bail!("missing module path");
    };
    let wasm = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let module = SharedModule::decode(&wasm)
        .with_context(|| format!("failed to decode {}", path.display()))?;
    debug!("decoded {}", path.display());

    if matches.get_flag("dump") {
        dump(module.module());
    }
    let Some(export) = matches.get_one::<String>("export") else {
        return Ok(());
    };

    let mut config = Config::default()
        .compile(!matches.get_flag("no-compile"))
        .fuel(matches.get_one::<u64>("fuel").copied());
    if let Some(depth) = matches.get_one::<usize>("max-call-depth") {
        config = config.max_call_depth(*depth);
    }

    let mut runtime = Runtime::instantiate_with_config(&module, Imports::new(), config)?;
    let params = match module.module().export(export).map(|e| e.desc) {
        Some(ExportDesc::Func(idx)) => module
            .module()
            .func_type(idx)
            .map(|ty| ty.params.clone())
            .unwrap_or_default(),
        _ => bail!("no exported function named {export}"),
    };

    let raw: Vec<&String> = matches
        .get_many::<String>("args")
        .map(|args| args.collect())
        .unwrap_or_default();
    if raw.len() != params.len() {
        bail!(
            "{export} takes {} arguments, got {}",
            params.len(),
            raw.len()
        );
    }
    let args = raw
        .iter()
        .zip(&params)
        .map(|(arg, ty)| parse_arg(arg, *ty))
        .collect::<Result<Vec<_>>>()?;

    let results = runtime.invoke(export, &args)?;
    for value in results {
        println!("{value}");
    }
    Ok(())
}

fn parse_arg(arg: &str, ty: ValueType) -> Result<Value> {
    let value = match ty {
        ValueType::I32 => arg
            .parse::<i32>()
            .map(Value::I32)
            .or_else(|_| arg.parse::<u32>().map(Value::from))?,
        ValueType::I64 => arg
            .parse::<i64>()
            .map(Value::I64)
            .or_else(|_| arg.parse::<u64>().map(|v| Value::I64(v as i64)))?,
        ValueType::F32 => Value::F32(arg.parse()?),
        ValueType::F64 => Value::F64(arg.parse()?),
    };
    Ok(value)
}

fn dump(module: &Module) {
    println!("types:");
    for (idx, ty) in module.types.iter().enumerate() {
        println!("  {idx}: {ty}");
    }
    println!("imports:");
    for import in &module.imports {
        let kind = match import.desc {
            ImportDesc::Func(type_idx) => format!("func type {type_idx}"),
            ImportDesc::Table(_) => "table".to_string(),
            ImportDesc::Memory(limits) => format!("memory {limits:?}"),
            ImportDesc::Global(ty) => format!("global {ty:?}"),
        };
        println!("  {}.{}: {kind}", import.module, import.field);
    }
    println!("functions: {}", module.functions.len());
    for memory in &module.memories {
        println!("memory: {:?}", memory.limits);
    }
    if let Some(start) = module.start {
        println!("start: {start}");
    }
    println!("exports:");
    for export in &module.exports {
        println!("  {}: {:?}", export.name, export.desc);
    }
}
