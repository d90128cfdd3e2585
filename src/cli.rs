//! Storage-core admin/diagnostic CLI.
//!
//! This talks directly to an in-process [`ServerContext`] — there is no
//! client/server split and no wire protocol, matching the crate's scope.
//! It exists for the same reason `pg_resetxlog`/`pg_controldata` exist
//! alongside the real backend: a way to poke at the storage layer by hand
//! without writing a test.

use std::env;
use std::process::ExitCode;

use rusty_db::common::{BlockNumber, RelationId, BLOCK_SIZE};
use rusty_db::transaction::{LockMode, LockTag};
use rusty_db::{DatabaseConfig, ServerContext};

fn usage() -> &'static str {
    "usage: rusty-db-cli <data-dir> <command> [args...]\n\n\
     commands:\n  \
     create <tablespace> <relation>            create a relation's segment 0\n  \
     extend <tablespace> <relation> <text>     append one block through the buffer pool\n  \
     read   <tablespace> <relation> <block>    read one block and print its contents\n  \
     count  <tablespace> <relation>            print the relation's block count\n  \
     lock-demo <tablespace> <relation>         acquire then release an exclusive lock\n"
}

fn parse_relation(tablespace: &str, relation: &str) -> Result<RelationId, String> {
    let tablespace_oid = tablespace.parse().map_err(|_| format!("invalid tablespace oid: {tablespace}"))?;
    let relation_oid = relation.parse().map_err(|_| format!("invalid relation oid: {relation}"))?;
    Ok(RelationId::new(tablespace_oid, relation_oid))
}

fn arg(args: &[String], index: usize) -> Result<&str, String> {
    args.get(index).map(String::as_str).ok_or_else(|| format!("missing argument\n\n{}", usage()))
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        print!("{}", usage());
        return Ok(());
    }

    let data_dir = args[1].clone();
    let command = args[2].as_str();

    let config = DatabaseConfig {
        data_dir,
        ..DatabaseConfig::default()
    };
    let ctx = ServerContext::initialize(config).map_err(|err| format!("failed to initialize storage core: {err}"))?;

    match command {
        "create" => {
            let relation = parse_relation(arg(&args, 3)?, arg(&args, 4)?)?;
            ctx.storage.create(relation).map_err(|err| err.to_string())?;
            println!("created relation {}.{}", relation.tablespace_oid, relation.relation_oid);
        }
        "extend" => {
            let relation = parse_relation(arg(&args, 3)?, arg(&args, 4)?)?;
            let text = args.get(5).cloned().unwrap_or_default();
            ctx.storage.create(relation).map_err(|err| err.to_string())?;
            let mut block = vec![0u8; BLOCK_SIZE];
            let bytes = text.as_bytes();
            block[..bytes.len().min(BLOCK_SIZE)].copy_from_slice(&bytes[..bytes.len().min(BLOCK_SIZE)]);
            let new_block = ctx.storage.extend(relation, &block).map_err(|err| err.to_string())?;
            println!("extended relation to block {new_block}");
        }
        "read" => {
            let relation = parse_relation(arg(&args, 3)?, arg(&args, 4)?)?;
            let block_no: u32 = arg(&args, 5)?.parse().map_err(|_| "invalid block number".to_string())?;
            let id = ctx
                .buffer_pool
                .read_buffer(relation, BlockNumber(block_no))
                .map_err(|err| err.to_string())?;
            let printable: String = ctx.buffer_pool.with_page(id, |page| {
                String::from_utf8_lossy(page.as_slice())
                    .trim_end_matches('\0')
                    .to_string()
            });
            ctx.buffer_pool.release_buffer(id);
            println!("block {block_no}: {printable:?}");
        }
        "count" => {
            let relation = parse_relation(arg(&args, 3)?, arg(&args, 4)?)?;
            let blocks = ctx.storage.count_blocks(relation).map_err(|err| err.to_string())?;
            println!("relation {}.{} has {blocks} block(s)", relation.tablespace_oid, relation.relation_oid);
        }
        "lock-demo" => {
            let relation = parse_relation(arg(&args, 3)?, arg(&args, 4)?)?;
            let process = ctx.new_process_id();
            let tag = LockTag::relation(relation.tablespace_oid, relation.relation_oid);
            ctx.lock_manager
                .acquire(tag, LockMode::AccessExclusive, process, 1)
                .map_err(|err| err.to_string())?;
            println!("acquired AccessExclusive on {}.{}", relation.tablespace_oid, relation.relation_oid);
            ctx.lock_manager
                .release(tag, LockMode::AccessExclusive, process, 1)
                .map_err(|err| err.to_string())?;
            println!("released");
        }
        other => return Err(format!("unknown command: {other}\n\n{}", usage())),
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
