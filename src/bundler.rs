//! Bundles an entrypoint and its imports into one plain script.
//!
//! The output has no `import`/`export` left: the entrypoint's namespace is
//! assigned to the sandbox-provided `module.exports`, Node built-ins resolve
//! to (usually absent) globals, and WASM imports are rewritten through the
//! [`WasmAssetPlugin`]. Comments are dropped and the source map is inlined.

use anyhow::{anyhow, bail, Result};
use base64::Engine;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use swc_bundler::{BundleKind, Bundler as SwcBundlerCore, Config, Hook, Load, ModuleData, ModuleType};
use swc_common::{source_map::DefaultSourceMapGenConfig, sync::Lrc, FileName, Globals, Mark, SourceMap, GLOBALS};
use swc_ecma_ast::{
    EsVersion, ImportSpecifier, KeyValueProp, Module, ModuleDecl, ModuleExportName, ModuleItem,
    Pass, Program,
};
use swc_ecma_codegen::{text_writer::JsWriter, Emitter};
use swc_ecma_loader::resolve::{Resolution, Resolve};
use swc_ecma_parser::{lexer::Lexer, EsSyntax, Parser, StringInput, Syntax, TsSyntax};
use swc_ecma_transforms_base::helpers::Helpers;
use swc_ecma_transforms_base::resolver;
use swc_ecma_transforms_typescript::strip;

use crate::wasm::{WasmAssetPlugin, WASM_NAMESPACE};

const ENTRY_MODULE: &str = "edge:entry";
const BUILTIN_NAMESPACE: &str = "edge-builtin:";

/// Node core modules that resolve to globals instead of imports.
const NODE_BUILTINS: &[&str] = &[
    "assert", "async_hooks", "buffer", "child_process", "cluster", "console", "constants",
    "crypto", "dgram", "diagnostics_channel", "dns", "domain", "events", "fs", "http", "http2",
    "https", "inspector", "module", "net", "os", "path", "perf_hooks", "process", "punycode",
    "querystring", "readline", "repl", "stream", "string_decoder", "sys", "timers", "tls",
    "trace_events", "tty", "url", "util", "v8", "vm", "wasi", "worker_threads", "zlib",
];

/// The bundler contract the compiler depends on.
pub trait Bundler: Send + Sync {
    /// Bundle `entry`, routing binary-module imports through `plugin`.
    ///
    /// `Ok(None)` means the bundler ran but produced no output.
    fn bundle(&self, entry: &Path, plugin: Arc<WasmAssetPlugin>) -> Result<Option<String>>;
}

/// Bundler settings.
#[derive(Debug, Clone)]
pub struct SwcBundler {
    /// Syntax level of the emitted code; matches what the sandbox's V8 runs.
    pub target: EsVersion,
    pub inline_source_map: bool,
}

impl Default for SwcBundler {
    fn default() -> Self {
        Self {
            target: EsVersion::Es2022,
            inline_source_map: true,
        }
    }
}

impl Bundler for SwcBundler {
    fn bundle(&self, entry: &Path, plugin: Arc<WasmAssetPlugin>) -> Result<Option<String>> {
        let cm: Lrc<SourceMap> = Default::default();
        let globals = Globals::new();
        let loader = EdgeLoader {
            cm: cm.clone(),
            entry: entry.to_path_buf(),
        };
        let resolver = EdgeResolver { plugin };

        let mut bundler = SwcBundlerCore::new(
            &globals,
            cm.clone(),
            loader,
            resolver,
            Config {
                require: false,
                disable_inliner: false,
                disable_hygiene: false,
                disable_fixer: false,
                disable_dce: false,
                external_modules: Vec::new(),
                module: ModuleType::Es,
            },
            Box::new(NoopHook),
        );

        let mut entries = HashMap::new();
        entries.insert("entry".to_string(), FileName::Custom(ENTRY_MODULE.to_string()));

        let bundles = GLOBALS.set(&globals, || bundler.bundle(entries))?;
        let bundle = match bundles
            .into_iter()
            .find(|bundle| matches!(bundle.kind, BundleKind::Named { .. }))
        {
            Some(bundle) => bundle,
            None => return Ok(None),
        };

        let mut buf = Vec::new();
        let mut mappings = Vec::new();
        {
            let mut emitter = Emitter {
                cfg: swc_ecma_codegen::Config::default().with_target(self.target),
                comments: None,
                cm: cm.clone(),
                wr: JsWriter::new(cm.clone(), "\n", &mut buf, Some(&mut mappings)),
            };
            emitter
                .emit_module(&bundle.module)
                .map_err(|err| anyhow!("Failed to emit bundle: {}", err))?;
        }

        let mut code = String::from_utf8(buf).map_err(|err| anyhow!("{}", err))?;
        if code.trim().is_empty() {
            return Ok(None);
        }

        if self.inline_source_map {
            let map = cm.build_source_map(&mappings, None, DefaultSourceMapGenConfig);
            let mut map_buf = Vec::new();
            map.to_writer(&mut map_buf)
                .map_err(|err| anyhow!("Failed to write source map: {}", err))?;
            code.push_str("\n//# sourceMappingURL=data:application/json;base64,");
            code.push_str(&base64::engine::general_purpose::STANDARD.encode(map_buf));
            code.push('\n');
        }

        Ok(Some(code))
    }
}

struct EdgeLoader {
    cm: Lrc<SourceMap>,
    entry: PathBuf,
}

impl EdgeLoader {
    fn source_for(&self, file: &FileName) -> Result<(String, Option<PathBuf>)> {
        match file {
            FileName::Real(path) => {
                let source = std::fs::read_to_string(path)
                    .map_err(|err| anyhow!("Failed to read {}: {}", path.display(), err))?;
                Ok((source, Some(path.clone())))
            }
            FileName::Custom(name) if name == ENTRY_MODULE => {
                let specifier = serde_json::to_string(&self.entry.to_string_lossy())?;
                Ok((
                    format!(
                        "import * as entry from {};\nmodule.exports = entry;\n",
                        specifier
                    ),
                    None,
                ))
            }
            FileName::Custom(name) if name.starts_with(WASM_NAMESPACE) => {
                let source = WasmAssetPlugin::virtual_module(name)
                    .ok_or_else(|| anyhow!("Invalid WASM module name: {}", name))?;
                Ok((source, None))
            }
            FileName::Custom(name) if name.starts_with(BUILTIN_NAMESPACE) => {
                let builtin = &name[BUILTIN_NAMESPACE.len()..];
                Ok((
                    format!(
                        "export default globalThis[{}];",
                        serde_json::to_string(builtin)?
                    ),
                    None,
                ))
            }
            other => bail!("Unsupported file name: {other:?}"),
        }
    }
}

impl Load for EdgeLoader {
    fn load(&self, file: &FileName) -> Result<ModuleData, anyhow::Error> {
        let (source, path) = self.source_for(file)?;

        let fm = self.cm.new_source_file(file.clone().into(), source);
        let syntax = match path {
            Some(ref path) => syntax_for_path(path),
            None => es_syntax(),
        };
        let lexer = Lexer::new(syntax, EsVersion::Es2022, StringInput::from(&*fm), None);
        let mut parser = Parser::new_from(lexer);
        let mut module = parser
            .parse_module()
            .map_err(|err| anyhow!("Failed to parse {}: {:?}", fm.name, err))?;
        if path.is_some() {
            rewrite_builtin_imports(&self.cm, &mut module)?;
        }

        let unresolved_mark = Mark::new();
        let top_level_mark = Mark::new();
        let mut program = Program::Module(module);
        let mut pass = resolver(unresolved_mark, top_level_mark, false);
        pass.process(&mut program);

        if path.as_deref().map_or(false, is_typescript) {
            let mut pass = strip(unresolved_mark, top_level_mark);
            pass.process(&mut program);
        }

        let module = match program {
            Program::Module(module) => module,
            Program::Script(_) => bail!("Unexpected script output when bundling module"),
        };

        Ok(ModuleData {
            fm,
            module,
            helpers: Helpers::new(false),
        })
    }
}

struct EdgeResolver {
    plugin: Arc<WasmAssetPlugin>,
}

impl EdgeResolver {
    fn resolve_from_node_modules(&self, start_dir: &Path, specifier: &str) -> Option<PathBuf> {
        let mut current = start_dir;
        loop {
            let node_modules = current.join("node_modules");
            if node_modules.is_dir() {
                if let Some(found) = resolve_with_candidates(&node_modules.join(specifier)) {
                    return Some(found);
                }
            }
            current = current.parent()?;
        }
    }
}

impl Resolve for EdgeResolver {
    fn resolve(&self, base: &FileName, specifier: &str) -> Result<Resolution, anyhow::Error> {
        let base_dir = match base {
            FileName::Real(path) => path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            _ => PathBuf::from("."),
        };

        if WasmAssetPlugin::matches(specifier) {
            let name = self.plugin.intercept(specifier, &base_dir)?;
            return Ok(Resolution {
                filename: FileName::Custom(name),
                slug: None,
            });
        }

        if let Some(builtin) = node_builtin(specifier) {
            return Ok(Resolution {
                filename: FileName::Custom(format!("{}{}", BUILTIN_NAMESPACE, builtin)),
                slug: None,
            });
        }

        let is_relative = specifier.starts_with("./")
            || specifier.starts_with("../")
            || specifier.starts_with('/');

        let target = if specifier.starts_with('/') {
            resolve_with_candidates(Path::new(specifier))
        } else if is_relative {
            resolve_with_candidates(&base_dir.join(specifier))
        } else {
            self.resolve_from_node_modules(&base_dir, specifier)
        };

        match target {
            Some(path) => Ok(Resolution {
                filename: FileName::Real(path),
                slug: None,
            }),
            None => bail!("Unable to resolve {specifier} from {base:?}"),
        }
    }
}

struct NoopHook;

impl Hook for NoopHook {
    fn get_import_meta_props(
        &self,
        _span: swc_common::Span,
        _module_record: &swc_bundler::ModuleRecord,
    ) -> Result<Vec<KeyValueProp>, anyhow::Error> {
        Ok(Vec::new())
    }
}

/// `node:fs` and `fs` both name the `fs` built-in.
fn node_builtin(specifier: &str) -> Option<&str> {
    if let Some(name) = specifier.strip_prefix("node:") {
        return Some(name);
    }
    let root = specifier.split('/').next().unwrap_or(specifier);
    NODE_BUILTINS.contains(&root).then_some(specifier)
}

/// Replace static imports of Node built-ins with reads of the matching
/// global, so named bindings like `import { Buffer } from "node:buffer"`
/// stay bound (to `undefined` when the global is absent).
fn rewrite_builtin_imports(cm: &Lrc<SourceMap>, module: &mut Module) -> Result<()> {
    let mut body = Vec::with_capacity(module.body.len());
    for item in std::mem::take(&mut module.body) {
        let import = match item {
            ModuleItem::ModuleDecl(ModuleDecl::Import(import)) if !import.type_only => import,
            other => {
                body.push(other);
                continue;
            }
        };
        let source = import.src.value.to_string_lossy().into_owned();
        match node_builtin(&source) {
            Some(name) => {
                let bindings = builtin_bindings(name, &import.specifiers)?;
                body.extend(parse_snippet(cm, bindings)?);
            }
            None => body.push(ModuleItem::ModuleDecl(ModuleDecl::Import(import))),
        }
    }
    module.body = body;
    Ok(())
}

fn builtin_bindings(name: &str, specifiers: &[ImportSpecifier]) -> Result<String> {
    let global = format!("globalThis[{}]", serde_json::to_string(name)?);
    let mut code = String::new();
    for specifier in specifiers {
        match specifier {
            ImportSpecifier::Default(default) => {
                code.push_str(&format!("const {} = {};\n", default.local.sym, global));
            }
            ImportSpecifier::Namespace(namespace) => {
                code.push_str(&format!("const {} = {};\n", namespace.local.sym, global));
            }
            ImportSpecifier::Named(named) if named.is_type_only => {}
            ImportSpecifier::Named(named) => {
                let imported = match &named.imported {
                    Some(ModuleExportName::Ident(ident)) => ident.sym.to_string(),
                    Some(ModuleExportName::Str(name)) => name.value.to_string_lossy().into_owned(),
                    None => named.local.sym.to_string(),
                };
                code.push_str(&format!(
                    "const {} = {}?.[{}];\n",
                    named.local.sym,
                    global,
                    serde_json::to_string(&imported)?
                ));
            }
        }
    }
    Ok(code)
}

fn parse_snippet(cm: &Lrc<SourceMap>, code: String) -> Result<Vec<ModuleItem>> {
    let fm = cm.new_source_file(FileName::Anon.into(), code);
    let lexer = Lexer::new(es_syntax(), EsVersion::Es2022, StringInput::from(&*fm), None);
    Parser::new_from(lexer)
        .parse_module()
        .map(|module| module.body)
        .map_err(|err| anyhow!("Failed to rewrite built-in import: {:?}", err))
}

fn resolve_with_candidates(target: &Path) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if target.extension().is_none() {
        for ext in ["ts", "tsx", "js", "mjs", "jsx"] {
            candidates.push(target.with_extension(ext));
        }
        for index in ["index.ts", "index.tsx", "index.js", "index.mjs"] {
            candidates.push(target.join(index));
        }
    }
    candidates.push(target.to_path_buf());

    candidates.into_iter().find(|candidate| candidate.is_file())
}

fn es_syntax() -> Syntax {
    Syntax::Es(EsSyntax {
        jsx: false,
        export_default_from: true,
        import_attributes: true,
        ..Default::default()
    })
}

fn syntax_for_path(path: &Path) -> Syntax {
    match path.extension().and_then(|ext| ext.to_str()).unwrap_or("") {
        "ts" | "mts" => Syntax::Typescript(TsSyntax {
            tsx: false,
            decorators: false,
            dts: false,
            no_early_errors: true,
            disallow_ambiguous_jsx_like: true,
        }),
        "tsx" => Syntax::Typescript(TsSyntax {
            tsx: true,
            decorators: false,
            dts: false,
            no_early_errors: true,
            disallow_ambiguous_jsx_like: true,
        }),
        _ => es_syntax(),
    }
}

fn is_typescript(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("ts") | Some("tsx") | Some("mts")
    )
}
