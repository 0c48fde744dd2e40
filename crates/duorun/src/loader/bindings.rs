//! # Built-in modules
//!
//! The capabilities every preload script may import. Strings and argument
//! lists cross as `(ptr, len)` pairs into the script's exported `memory`;
//! argument lists are JSON arrays of plain values.

use std::sync::Arc;

use tracing::error;
use tracing::info;
use tracing::warn;
use wasmtime::Caller;
use wasmtime::Extern;
use wasmtime::Linker;
use wasmtime::Memory;

use duopack::TypedBuffer;
use duopack::Value;
use duorpc::GuestPort;

use crate::error::Error;
use crate::error::Result;
use crate::loader::modules::HostModule;

/// Store data of one running script.
pub struct ScriptCtx {
    pub port: Arc<GuestPort>,
    pub path: String,
    pub platform: String,
    pub is_main_frame: bool,
}

fn link_err(e: impl std::fmt::Display) -> Error {
    Error::Link(e.to_string())
}

fn memory(caller: &mut Caller<'_, ScriptCtx>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("script does not export 'memory'"))
}

fn read_bytes(caller: &mut Caller<'_, ScriptCtx>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    let memory = memory(caller)?;
    let start = usize::try_from(ptr).map_err(|_| wasmtime::Error::msg("negative pointer"))?;
    let len = usize::try_from(len).map_err(|_| wasmtime::Error::msg("negative length"))?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| wasmtime::Error::msg("range overflows"))?;
    memory
        .data(&*caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| wasmtime::Error::msg(format!("range {}..{} is outside memory", start, end)))
}

fn read_str(caller: &mut Caller<'_, ScriptCtx>, ptr: i32, len: i32) -> wasmtime::Result<String> {
    String::from_utf8(read_bytes(caller, ptr, len)?).map_err(|_| wasmtime::Error::msg("string is not UTF-8"))
}

/// Writes `bytes` to `[ptr, ptr + cap)`. Returns the byte count, or -1 if it
/// does not fit.
fn write_out(caller: &mut Caller<'_, ScriptCtx>, ptr: i32, cap: i32, bytes: &[u8]) -> wasmtime::Result<i32> {
    let cap = usize::try_from(cap).map_err(|_| wasmtime::Error::msg("negative capacity"))?;
    if bytes.len() > cap {
        return Ok(-1);
    }
    let len = i32::try_from(bytes.len()).map_err(|_| wasmtime::Error::msg("output too large"))?;
    let memory = memory(caller)?;
    let start = usize::try_from(ptr).map_err(|_| wasmtime::Error::msg("negative pointer"))?;
    let target = memory
        .data_mut(&mut *caller)
        .get_mut(start..start.saturating_add(bytes.len()))
        .ok_or_else(|| wasmtime::Error::msg("output buffer is outside memory"))?;
    target.copy_from_slice(bytes);
    Ok(len)
}

/// Parses a JSON argument array. An empty range means no arguments.
fn read_args(caller: &mut Caller<'_, ScriptCtx>, ptr: i32, len: i32) -> wasmtime::Result<Vec<Value>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let bytes = read_bytes(caller, ptr, len)?;
    let json: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|e| wasmtime::Error::msg(format!("arguments are not JSON: {}", e)))?;
    match duopack::decode_json(&json).map_err(|e| wasmtime::Error::msg(e.to_string()))? {
        Value::List(args) => Ok(args),
        other => Err(wasmtime::Error::msg(format!(
            "arguments must be a JSON array, got {}",
            other.kind_name()
        ))),
    }
}

/// `bridge`: messages to the host.
///
/// - `send(ch_ptr, ch_len, args_ptr, args_len) -> i32`
/// - `send_sync(ch_ptr, ch_len, args_ptr, args_len, out_ptr, out_cap) -> i32`
///   writes the JSON reply and returns its length, or -1 if `out_cap` is too
///   small. A rejected call traps.
pub struct Bridge;

impl HostModule for Bridge {
    fn name(&self) -> &str {
        "bridge"
    }

    fn install(&self, linker: &mut Linker<ScriptCtx>) -> Result<()> {
        linker
            .func_wrap(
                "bridge",
                "send",
                |mut caller: Caller<'_, ScriptCtx>, ch_ptr: i32, ch_len: i32, args_ptr: i32, args_len: i32| -> wasmtime::Result<i32> {
                    let channel = read_str(&mut caller, ch_ptr, ch_len)?;
                    let args = read_args(&mut caller, args_ptr, args_len)?;
                    caller
                        .data()
                        .port
                        .send(&channel, args)
                        .map_err(|e| wasmtime::Error::msg(e.to_string()))?;
                    Ok(0i32)
                },
            )
            .map_err(link_err)?;

        linker
            .func_wrap(
                "bridge",
                "send_sync",
                |mut caller: Caller<'_, ScriptCtx>,
                 ch_ptr: i32,
                 ch_len: i32,
                 args_ptr: i32,
                 args_len: i32,
                 out_ptr: i32,
                 out_cap: i32|
                 -> wasmtime::Result<i32> {
                    let channel = read_str(&mut caller, ch_ptr, ch_len)?;
                    let args = read_args(&mut caller, args_ptr, args_len)?;
                    let port = Arc::clone(&caller.data().port);
                    let reply = port
                        .send_sync(&channel, args)
                        .map_err(|e| wasmtime::Error::msg(e.to_string()))?;
                    let json = duopack::encode_json(&reply).map_err(|e| wasmtime::Error::msg(e.to_string()))?;
                    let bytes = serde_json::to_vec(&json).map_err(|e| wasmtime::Error::msg(e.to_string()))?;
                    write_out(&mut caller, out_ptr, out_cap, &bytes)
                },
            )
            .map_err(link_err)?;

        Ok(())
    }
}

/// `process`: a read-only view of the context the script runs in.
pub struct Process;

impl HostModule for Process {
    fn name(&self) -> &str {
        "process"
    }

    fn install(&self, linker: &mut Linker<ScriptCtx>) -> Result<()> {
        linker
            .func_wrap("process", "context_id", |caller: Caller<'_, ScriptCtx>| {
                caller.data().port.connection_id().0 as i64
            })
            .map_err(link_err)?;

        linker
            .func_wrap("process", "is_main_frame", |caller: Caller<'_, ScriptCtx>| {
                caller.data().is_main_frame as i32
            })
            .map_err(link_err)?;

        linker
            .func_wrap(
                "process",
                "platform",
                |mut caller: Caller<'_, ScriptCtx>, out_ptr: i32, out_cap: i32| -> wasmtime::Result<i32> {
                    let platform = caller.data().platform.clone();
                    write_out(&mut caller, out_ptr, out_cap, platform.as_bytes())
                },
            )
            .map_err(link_err)?;

        Ok(())
    }
}

/// `console`: `log`, `warn` and `error`, each taking `(ptr, len)`.
pub struct Console;

impl HostModule for Console {
    fn name(&self) -> &str {
        "console"
    }

    fn install(&self, linker: &mut Linker<ScriptCtx>) -> Result<()> {
        linker
            .func_wrap("console", "log", |mut caller: Caller<'_, ScriptCtx>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                let text = read_str(&mut caller, ptr, len)?;
                info!(script = %caller.data().path, "{}", text);
                Ok(())
            })
            .map_err(link_err)?;

        linker
            .func_wrap("console", "warn", |mut caller: Caller<'_, ScriptCtx>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                let text = read_str(&mut caller, ptr, len)?;
                warn!(script = %caller.data().path, "{}", text);
                Ok(())
            })
            .map_err(link_err)?;

        linker
            .func_wrap("console", "error", |mut caller: Caller<'_, ScriptCtx>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                let text = read_str(&mut caller, ptr, len)?;
                error!(script = %caller.data().path, "{}", text);
                Ok(())
            })
            .map_err(link_err)?;

        Ok(())
    }
}

/// `buffer`: `send(ch_ptr, ch_len, data_ptr, data_len) -> i32` sends one
/// byte buffer copied out of script memory.
pub struct BufferModule;

impl HostModule for BufferModule {
    fn name(&self) -> &str {
        "buffer"
    }

    fn install(&self, linker: &mut Linker<ScriptCtx>) -> Result<()> {
        linker
            .func_wrap(
                "buffer",
                "send",
                |mut caller: Caller<'_, ScriptCtx>, ch_ptr: i32, ch_len: i32, data_ptr: i32, data_len: i32| -> wasmtime::Result<i32> {
                    let channel = read_str(&mut caller, ch_ptr, ch_len)?;
                    let data = read_bytes(&mut caller, data_ptr, data_len)?;
                    caller
                        .data()
                        .port
                        .send(&channel, vec![Value::Buffer(TypedBuffer::Buffer(data))])
                        .map_err(|e| wasmtime::Error::msg(e.to_string()))?;
                    Ok(0i32)
                },
            )
            .map_err(link_err)?;
        Ok(())
    }
}
