//! Lua-scripted components.
//!
//! `mlua::Lua` is not `Send`, so each bundle gets one worker thread that
//! owns its Lua state for the bundle's whole lifetime. The [`Component`]
//! hooks turn into commands on that thread's queue, which also keeps
//! packet handling in wire order.
//!
//! # Script contract
//!
//! The entry script returns a table:
//!
//! ```lua
//! local M = { name = "Echo", description = "Echoes messages" }
//!
//! function M.initialize(jid) log.info("bound as " .. jid) end
//!
//! function M.process_packet(xml)
//!     -- xml is the stanza as a string
//! end
//!
//! function M.shutdown() end
//!
//! return M
//! ```
//!
//! All three functions are optional. Host functions available to the
//! script:
//!
//! | Function | Returns |
//! |---|---|
//! | `xmpp.send(xml)` | nothing; raises on error |
//! | `xmpp.query(xml, timeout_ms)` | reply XML or `nil` on timeout |
//! | `xmpp.jid()` | component JID or `nil` before initialize |
//! | `xmpp.server_name()` | server domain or `nil` |
//! | `xmpp.new_id()` | fresh stanza id |
//! | `log.debug/info/warn/error(msg)` | nothing |
//!
//! `require` only searches the bundle directory and native modules are
//! disabled.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mlua::{Function, IntoLuaMulti, Lua, Table};

use crate::component::{Component, ComponentKey};
use crate::constants::SCRIPT_CALL_TIMEOUT;
use crate::error::{Error, Result};
use crate::manager::ComponentManager;
use crate::util::{lock, new_packet_id};
use crate::xmpp::{Jid, Packet};

/// Where a script's host calls are routed once the component is bound.
struct HostBinding {
    manager: Weak<ComponentManager>,
    key: ComponentKey,
    jid: Jid,
}

type SharedBinding = Arc<Mutex<Option<HostBinding>>>;

enum Command {
    Initialize {
        jid: String,
        reply: mpsc::SyncSender<std::result::Result<(), String>>,
    },
    Packet(String),
    Shutdown {
        reply: mpsc::SyncSender<()>,
    },
    Stop,
}

/// A component implemented by a Lua script.
pub struct LuaComponent {
    bundle: String,
    name: String,
    description: String,
    commands: Mutex<mpsc::Sender<Command>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    binding: SharedBinding,
}

impl std::fmt::Debug for LuaComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaComponent")
            .field("bundle", &self.bundle)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl LuaComponent {
    /// Start a worker for `bundle` and evaluate `script` on it.
    ///
    /// # Errors
    ///
    /// [`Error::Load`] if the script cannot be read, fails to evaluate,
    /// does not return a table, or takes too long.
    pub fn load(bundle: &str, class: &str, dir: &Path, script: &Path) -> Result<Arc<Self>> {
        let load_error = |reason: String| Error::Load {
            bundle: bundle.to_string(),
            class: class.to_string(),
            reason,
        };

        let source = fs::read_to_string(script)
            .map_err(|e| load_error(format!("cannot read {}: {e}", script.display())))?;

        let binding: SharedBinding = Arc::new(Mutex::new(None));
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let worker = {
            let bundle = bundle.to_string();
            let dir = dir.to_path_buf();
            let script = script.to_path_buf();
            let binding = Arc::clone(&binding);
            thread::Builder::new()
                .name(format!("whack-lua-{bundle}"))
                .spawn(move || {
                    let (lua, module) = match boot(&bundle, &dir, &script, &source, binding) {
                        Ok((lua, module, meta)) => {
                            let _ = ready_tx.send(Ok(meta));
                            (lua, module)
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    run(&bundle, &module, command_rx);
                    drop(module);
                    drop(lua);
                })?
        };

        let (name, description) = match ready_rx.recv_timeout(SCRIPT_CALL_TIMEOUT) {
            Ok(Ok(meta)) => meta,
            Ok(Err(reason)) => {
                let _ = worker.join();
                return Err(load_error(reason));
            }
            Err(_) => return Err(load_error("script did not finish loading in time".into())),
        };

        log::debug!("[Lua:{bundle}] Loaded {}", script.display());
        Ok(Arc::new(Self {
            bundle: bundle.to_string(),
            name: name.unwrap_or_else(|| bundle.to_string()),
            description: description.unwrap_or_default(),
            commands: Mutex::new(command_tx),
            worker: Mutex::new(Some(worker)),
            binding,
        }))
    }

    /// Stop the worker thread and drop the Lua state.
    ///
    /// Commands queued before this call are still handled first.
    pub fn stop(&self) {
        let _ = lock(&self.commands).send(Command::Stop);
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        *lock(&self.binding) = None;
    }

    fn call<T>(&self, make: impl FnOnce(mpsc::SyncSender<T>) -> Command) -> Option<T> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        if lock(&self.commands).send(make(reply_tx)).is_err() {
            return None;
        }
        reply_rx.recv_timeout(SCRIPT_CALL_TIMEOUT).ok()
    }
}

impl Component for LuaComponent {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn initialize(&self, jid: &Jid, manager: &Arc<ComponentManager>) -> Result<()> {
        *lock(&self.binding) = Some(HostBinding {
            manager: Arc::downgrade(manager),
            key: ComponentKey::of(self),
            jid: jid.clone(),
        });
        let jid = jid.to_string();
        match self.call(|reply| Command::Initialize { jid, reply }) {
            Some(Ok(())) => Ok(()),
            Some(Err(reason)) => Err(Error::Component(format!("{}: {reason}", self.bundle))),
            None => Err(Error::Component(format!(
                "{}: initialize did not return in time",
                self.bundle
            ))),
        }
    }

    fn process_packet(&self, packet: Packet) {
        if lock(&self.commands)
            .send(Command::Packet(packet.to_xml()))
            .is_err()
        {
            log::warn!("[Lua:{}] Worker stopped; dropping packet", self.bundle);
        }
    }

    fn shutdown(&self) {
        if self.call(|reply| Command::Shutdown { reply }).is_none() {
            log::warn!("[Lua:{}] shutdown did not return in time", self.bundle);
        }
        *lock(&self.binding) = None;
    }
}

impl Drop for LuaComponent {
    fn drop(&mut self) {
        self.stop();
    }
}

type ScriptMeta = (Option<String>, Option<String>);

/// Build the Lua state on the worker thread and evaluate the script.
fn boot(
    bundle: &str,
    dir: &Path,
    script: &Path,
    source: &str,
    binding: SharedBinding,
) -> std::result::Result<(Lua, Table, ScriptMeta), String> {
    let lua = Lua::new();
    scope_package_path(&lua, dir).map_err(|e| e.to_string())?;
    register_log(&lua, bundle).map_err(|e| e.to_string())?;
    register_xmpp(&lua, binding).map_err(|e| e.to_string())?;

    let module: Table = lua
        .load(source)
        .set_name(script.display().to_string())
        .eval()
        .map_err(|e| format!("script error: {e}"))?;
    let name: Option<String> = module.get("name").map_err(|e| e.to_string())?;
    let description: Option<String> = module.get("description").map_err(|e| e.to_string())?;

    Ok((lua, module, (name, description)))
}

fn run(bundle: &str, module: &Table, commands: mpsc::Receiver<Command>) {
    for command in commands {
        match command {
            Command::Initialize { jid, reply } => {
                let _ = reply.send(call_hook(module, "initialize", jid));
            }
            Command::Packet(xml) => {
                if let Err(e) = call_hook(module, "process_packet", xml) {
                    log::warn!("[Lua:{bundle}] process_packet failed: {e}");
                }
            }
            Command::Shutdown { reply } => {
                if let Err(e) = call_hook(module, "shutdown", ()) {
                    log::warn!("[Lua:{bundle}] shutdown failed: {e}");
                }
                let _ = reply.send(());
            }
            Command::Stop => break,
        }
    }
    log::debug!("[Lua:{bundle}] Worker stopped");
}

/// Call `module[hook](args)` if the script defines it.
fn call_hook(module: &Table, hook: &str, args: impl IntoLuaMulti) -> std::result::Result<(), String> {
    let function: Option<Function> = module.get(hook).map_err(|e| e.to_string())?;
    match function {
        Some(function) => function.call::<()>(args).map_err(|e| e.to_string()),
        None => Ok(()),
    }
}

/// Restrict `require` to the bundle directory.
fn scope_package_path(lua: &Lua, dir: &Path) -> mlua::Result<()> {
    let package: Table = lua.globals().get("package")?;
    package.set(
        "path",
        format!("{dir}/?.lua;{dir}/?/init.lua", dir = dir.display()),
    )?;
    package.set("cpath", "")?;
    Ok(())
}

fn register_log(lua: &Lua, bundle: &str) -> mlua::Result<()> {
    let table = lua.create_table()?;
    let levels = [
        ("debug", log::Level::Debug),
        ("info", log::Level::Info),
        ("warn", log::Level::Warn),
        ("error", log::Level::Error),
    ];
    for (name, level) in levels {
        let bundle = bundle.to_string();
        let function = lua.create_function(move |_, msg: String| {
            log::log!(target: "lua", level, "[Lua:{bundle}] {msg}");
            Ok(())
        })?;
        table.set(name, function)?;
    }
    lua.globals().set("log", table)
}

fn bound_manager(binding: &SharedBinding) -> mlua::Result<(Arc<ComponentManager>, ComponentKey)> {
    let guard = lock(binding);
    let bound = guard
        .as_ref()
        .ok_or_else(|| mlua::Error::RuntimeError("component is not initialized".into()))?;
    let manager = bound
        .manager
        .upgrade()
        .ok_or_else(|| mlua::Error::RuntimeError("component manager is gone".into()))?;
    Ok((manager, bound.key))
}

fn register_xmpp(lua: &Lua, binding: SharedBinding) -> mlua::Result<()> {
    let table = lua.create_table()?;

    let b = Arc::clone(&binding);
    table.set(
        "send",
        lua.create_function(move |_, xml: String| {
            let packet = Packet::parse(&xml).map_err(mlua::Error::external)?;
            let (manager, key) = bound_manager(&b)?;
            manager
                .send_packet_by_key(key, packet)
                .map_err(mlua::Error::external)
        })?,
    )?;

    let b = Arc::clone(&binding);
    table.set(
        "query",
        lua.create_function(move |_, (xml, timeout_ms): (String, Option<u64>)| {
            let packet = Packet::parse(&xml).map_err(mlua::Error::external)?;
            let (manager, key) = bound_manager(&b)?;
            let timeout = timeout_ms.map_or(SCRIPT_CALL_TIMEOUT, Duration::from_millis);
            let reply = manager
                .query_by_key(key, packet, timeout)
                .map_err(mlua::Error::external)?;
            Ok(reply.map(|p| p.to_xml()))
        })?,
    )?;

    let b = Arc::clone(&binding);
    table.set(
        "jid",
        lua.create_function(move |_, ()| Ok(lock(&b).as_ref().map(|bound| bound.jid.to_string())))?,
    )?;

    let b = Arc::clone(&binding);
    table.set(
        "server_name",
        lua.create_function(move |_, ()| {
            let guard = lock(&b);
            Ok(guard
                .as_ref()
                .and_then(|bound| bound.manager.upgrade())
                .and_then(|manager| manager.server_name()))
        })?,
    )?;

    table.set("new_id", lua.create_function(|_, ()| Ok(new_packet_id()))?)?;

    lua.globals().set("xmpp", table)
}

/// Script path for `class` inside `dir`: dots become directory separators.
pub fn script_path(dir: &Path, class: &str) -> PathBuf {
    dir.join(format!("{}.lua", class.replace('.', "/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("echo.lua");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_script_path_maps_dots_to_directories() {
        let dir = Path::new("/bundles/echo");
        assert_eq!(
            script_path(dir, "org.example.Echo"),
            PathBuf::from("/bundles/echo/org/example/Echo.lua")
        );
        assert_eq!(script_path(dir, "echo"), PathBuf::from("/bundles/echo/echo.lua"));
    }

    #[test]
    fn test_load_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"return { name = "Echo", description = "Echoes" }"#,
        );
        let component = LuaComponent::load("echo", "echo", dir.path(), &script).unwrap();
        assert_eq!(component.name(), "Echo");
        assert_eq!(component.description(), "Echoes");
        component.stop();
    }

    #[test]
    fn test_name_defaults_to_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "return {}");
        let component = LuaComponent::load("echo", "echo", dir.path(), &script).unwrap();
        assert_eq!(component.name(), "echo");
        assert_eq!(component.description(), "");
    }

    #[test]
    fn test_script_must_return_table() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "return 42");
        let err = LuaComponent::load("echo", "echo", dir.path(), &script).unwrap_err();
        assert!(matches!(err, Error::Load { .. }), "got {err:?}");
    }

    #[test]
    fn test_syntax_error_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "return {");
        assert!(LuaComponent::load("echo", "echo", dir.path(), &script).is_err());
    }

    #[test]
    fn test_require_is_scoped_to_bundle() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("helper.lua"), "return { greeting = 'hi' }").unwrap();
        let script = write_script(
            dir.path(),
            "local helper = require('helper')\nreturn { name = helper.greeting }",
        );
        let component = LuaComponent::load("echo", "echo", dir.path(), &script).unwrap();
        assert_eq!(component.name(), "hi");
    }

    #[test]
    fn test_send_before_initialize_raises() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"
            local ok = pcall(xmpp.send, "<message/>")
            return { name = ok and "sent" or "refused", description = xmpp.new_id() }
            "#,
        );
        let component = LuaComponent::load("echo", "echo", dir.path(), &script).unwrap();
        assert_eq!(component.name(), "refused");
        assert_eq!(component.description().len(), 32);
    }
}
