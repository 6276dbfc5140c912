//! Browser-side sources: the module loader library and the extension that
//! patches it.

use std::path::Path;

use crate::cache::bundle::{CACHED_MODULES_GLOBAL, CACHE_VERSION_GLOBAL};
use crate::config::PluginOptions;
use crate::error::Error;
use crate::hmr::{
    HMR_CLIENT_PATH, INVALIDATED_URLS_GLOBAL, INVALIDATE_MODULES_EVENT, UPDATE_MODULES_EVENT,
};

/// Loader library plus the rendered extension, ready for injection.
#[derive(Debug, Clone)]
pub struct ClientAssets {
    loader: String,
    extension: String,
}

impl ClientAssets {
    /// Read the loader library from `options.loader_path` (relative to
    /// `root` unless absolute).
    pub fn load(root: &Path, options: &PluginOptions) -> Result<Self, Error> {
        let path = if options.loader_path.is_absolute() {
            options.loader_path.clone()
        } else {
            root.join(&options.loader_path)
        };
        let loader = std::fs::read_to_string(&path).map_err(|source| Error::LoaderMissing {
            path: path.clone(),
            source,
        })?;
        Ok(Self::from_loader_source(loader, options))
    }

    /// Use an in-memory loader library.
    pub fn from_loader_source(loader: impl Into<String>, options: &PluginOptions) -> Self {
        Self {
            loader: loader.into(),
            extension: render_extension(options),
        }
    }

    pub fn loader(&self) -> &str {
        &self.loader
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Loader followed by the extension, as one script.
    pub fn script(&self) -> String {
        format!("{}\n{}", self.loader, self.extension)
    }
}

fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Render the extension for `options`.
#[must_use]
pub fn render_extension(options: &PluginOptions) -> String {
    let extensions = serde_json::to_string(&options.extensions).unwrap_or_else(|_| "[]".to_string());
    EXTENSION_RUNTIME
        .replace("__MAX_UNCACHED_MODULES__", &options.max_uncached_modules.to_string())
        .replace("__EXTENSIONS__", &extensions)
        .replace("__EXTERNAL_DIR__", &js_string(&options.external_dir))
        .replace("__HMR_CLIENT_PATH__", &js_string(HMR_CLIENT_PATH))
        .replace("__INVALIDATE_EVENT__", &js_string(INVALIDATE_MODULES_EVENT))
        .replace("__UPDATE_EVENT__", &js_string(UPDATE_MODULES_EVENT))
        .replace("__CACHED_MODULES__", CACHED_MODULES_GLOBAL)
        .replace("__CACHE_VERSION__", CACHE_VERSION_GLOBAL)
        .replace("__INVALIDATED_URLS__", INVALIDATED_URLS_GLOBAL)
}

/// The loader extension.
///
/// Patches `resolve`, `register` and `instantiate` on the loader prototype:
/// - cached, non-invalidated modules are replayed from the bundle
/// - misses are counted once a bundle is present, and past the threshold the
///   server is asked (once per cache version) to regenerate it
/// - root-relative scripts that register without being imported run
///   immediately
const EXTENSION_RUNTIME: &str = r"
(function () {
  const maxUncachedModules = __MAX_UNCACHED_MODULES__;
  const extensions = __EXTENSIONS__;
  const externalDir = __EXTERNAL_DIR__;

  const timestampRE = /\bt=\d{13}&?\b/;
  const importQueryRE = /(\?|&)import=?(?:&|$)/;
  const trailingSeparatorRE = /[?&]$/;

  const isWorker =
    typeof WorkerGlobalScope !== 'undefined' && self instanceof WorkerGlobalScope;
  const scope = globalThis;

  function normalizeUrl(url) {
    const { pathname, search } = new URL(url, location.href);
    return (pathname + search)
      .replace(timestampRE, '')
      .replace(trailingSeparatorRE, '')
      .replace(importQueryRE, '$1')
      .replace(trailingSeparatorRE, '');
  }

  function hasExtension(url) {
    const segment = url.split('?')[0].split('/').pop();
    const dot = segment.lastIndexOf('.');
    return dot > 0 && dot < segment.length - 1;
  }

  function candidates(url) {
    return hasExtension(url) ? [url] : [url, ...extensions.map((ext) => `${url}.${ext}`)];
  }

  let misses = 0;
  let notified = false;
  let installedVersion;
  let notifyUpdate;

  function syncVersion() {
    const version = scope.__CACHE_VERSION__;
    if (version !== installedVersion) {
      installedVersion = version;
      misses = 0;
      notified = false;
    }
  }

  function countMiss(url) {
    if (isWorker || !scope.__CACHED_MODULES__ || url.includes(externalDir)) return;
    misses++;
    if (misses > maxUncachedModules && !notified && typeof notifyUpdate === 'function') {
      notified = true;
      notifyUpdate();
    }
  }

  const proto = System.constructor.prototype;
  const originalResolve = proto.resolve;
  const originalRegister = proto.register;

  proto.resolve = function () {
    const resolved = Reflect.apply(originalResolve, this, arguments);
    if (!hasExtension(resolved)) {
      for (const ext of extensions) {
        if (this.has(`${resolved}.${ext}`)) return `${resolved}.${ext}`;
      }
    }
    return resolved;
  };

  const explicitImports = new Set();
  let replaying = false;
  let replayed;

  proto.register = function (name, deps, declare, metas) {
    if (typeof name !== 'string') {
      metas = declare;
      declare = deps;
      deps = name;
      name = undefined;
    }
    if (replaying) {
      replayed = [deps, declare, metas];
      return replayed;
    }
    if (name !== undefined && !explicitImports.has(name) && name.startsWith('/')) {
      this.import(name, null, { autoImportModule: [deps, declare, metas] });
    } else {
      return Reflect.apply(originalRegister, this, [deps, declare, metas]);
    }
  };

  proto.instantiate = async function (url, _parent, meta) {
    if (meta && meta.autoImportModule) return meta.autoImportModule;

    const path = normalizeUrl(url);
    syncVersion();

    const cached = scope.__CACHED_MODULES__;
    const invalidated = scope.__INVALIDATED_URLS__;
    if (!isWorker && cached && cached.has(path) && !(invalidated && invalidated.has(path))) {
      replaying = true;
      replayed = undefined;
      try {
        cached.get(path).code();
      } finally {
        replaying = false;
      }
      return replayed;
    }

    countMiss(path);

    const marked = candidates(path);
    marked.forEach((u) => explicitImports.add(u));
    try {
      await import(url);
    } finally {
      marked.forEach((u) => explicitImports.delete(u));
    }
    return this.getRegister(url);
  };

  if (!isWorker) {
    if (!scope.__INVALIDATED_URLS__) scope.__INVALIDATED_URLS__ = new Set();
    setTimeout(() => {
      import(__HMR_CLIENT_PATH__).then(({ createHotContext }) => {
        const hot = createHotContext('/@coalesce/runtime');
        hot.on(__INVALIDATE_EVENT__, (urls) => {
          for (const url of urls) scope.__INVALIDATED_URLS__.add(url);
        });
        notifyUpdate = () => hot.send(__UPDATE_EVENT__);
      });
    });
  }
})();
";
