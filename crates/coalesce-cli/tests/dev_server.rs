//! End-to-end tests for `coalesce dev`: start the binary on a free port and
//! drive it over HTTP.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

const LOADER: &str = "/* loader */ var System = { register() {} };";

struct DevServer {
    child: Child,
    base: String,
    _stdout: BufReader<ChildStdout>,
}

impl DevServer {
    fn start(root: &Path, extra: &[&str]) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_coalesce"))
            .arg("--cwd")
            .arg(root)
            .args(["dev", "--port", "0"])
            .args(extra)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn coalesce");

        let mut stdout = BufReader::new(child.stdout.take().unwrap());
        let mut line = String::new();
        let base = loop {
            line.clear();
            let read = stdout.read_line(&mut line).unwrap();
            assert!(read > 0, "server exited before listening");
            if let Some(addr) = line.trim().strip_prefix("Dev server running at ") {
                break addr.to_string();
            }
        };

        Self {
            child,
            base,
            _stdout: stdout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

impl Drop for DevServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn project(with_loader: bool) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(
        src.join("main.js"),
        "import { greet } from './greet.js';\nexport const msg = greet('world');\n",
    )
    .unwrap();
    std::fs::write(
        src.join("greet.js"),
        "export function greet(name) {\n  return `hello ${name}`;\n}\n",
    )
    .unwrap();

    if with_loader {
        let dist = dir.path().join("node_modules/systemjs/dist");
        std::fs::create_dir_all(&dist).unwrap();
        std::fs::write(dist.join("system.min.js"), LOADER).unwrap();
    }
    dir
}

#[tokio::test]
async fn test_modules_are_converted_and_bundled() {
    let dir = project(true);
    let server = DevServer::start(dir.path(), &[]);
    let client = reqwest::Client::new();

    let main = client.get(server.url("/src/main.js")).send().await.unwrap();
    assert_eq!(main.status(), 200);
    let main = main.text().await.unwrap();
    assert!(main.starts_with(r#"System.register("/src/main.js", ["./greet.js"]"#));

    let greet = client
        .get(server.url("/src/greet.js?t=1700000000000"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(greet.contains(r#"_export("greet", greet);"#));

    let bundle = client
        .get(server.url("/@coalesce/modules.js?v=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(bundle.status(), 200);
    assert_eq!(
        bundle.headers()["cache-control"].to_str().unwrap(),
        "max-age=3600, immutable"
    );
    let bundle = bundle.text().await.unwrap();
    assert!(bundle.starts_with("window.__COALESCE_CACHE_VERSION__ = "));
    assert!(bundle.contains(r#"["/src/main.js", { code: () => { System.register("/src/main.js""#));
    assert!(bundle.contains(r#"["/src/greet.js", { code: () => {"#));
    assert_eq!(bundle.matches("//#__COALESCE_CODE_INTERVAL__=").count(), 2);
    assert!(bundle.contains("//# sourceMappingURL=/@coalesce/modules.js.map?v="));

    let map: serde_json::Value = client
        .get(server.url("/@coalesce/modules.js.map"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(map["version"], 3);
    let sections = map["sections"].as_array().unwrap();
    assert_eq!(sections.len(), 2);
    let sources: Vec<&str> = sections
        .iter()
        .map(|s| s["map"]["sources"][0].as_str().unwrap())
        .collect();
    assert!(sources.contains(&"/src/main.js"));
    assert!(sources.contains(&"/src/greet.js"));
}

#[tokio::test]
async fn test_index_page_carries_loader_and_bundle() {
    let dir = project(true);
    let server = DevServer::start(dir.path(), &[]);

    let html = reqwest::get(server.url("/")).await.unwrap().text().await.unwrap();
    assert!(html.contains(LOADER));
    assert!(html.contains(r#"<script async src="/@coalesce/modules.js?v="#));
    assert!(html.contains("window.__COALESCE_INVALIDATED_URLS__ = new Set([]);"));
    assert!(html.contains("System.import('/src/main.js')"));
    assert!(html.contains(r#"<script type="module" src="/@hmr-client"></script>"#));

    let hmr = reqwest::get(server.url("/@hmr-client")).await.unwrap().text().await.unwrap();
    assert!(hmr.contains("export function createHotContext"));
}

#[tokio::test]
async fn test_missing_loader_serves_modules_individually() {
    let dir = project(false);
    let server = DevServer::start(dir.path(), &[]);

    let main = reqwest::get(server.url("/src/main.js")).await.unwrap().text().await.unwrap();
    assert!(main.starts_with("import { greet } from './greet.js';"));

    let bundle = reqwest::get(server.url("/@coalesce/modules.js")).await.unwrap();
    assert_eq!(bundle.status(), 404);
}

#[tokio::test]
async fn test_no_coalesce_flag() {
    let dir = project(true);
    let server = DevServer::start(dir.path(), &["--no-coalesce"]);

    let main = reqwest::get(server.url("/src/main.js")).await.unwrap().text().await.unwrap();
    assert!(main.starts_with("import { greet }"));

    let html = reqwest::get(server.url("/")).await.unwrap().text().await.unwrap();
    assert!(html.contains(r#"<script type="module" src="/src/main.js"></script>"#));
    assert!(!html.contains("__COALESCE_INVALIDATED_URLS__"));
}

#[tokio::test]
async fn test_config_file_moves_bundle_route() {
    let dir = project(true);
    std::fs::write(
        dir.path().join("coalesce.json"),
        r#"{"bundleUrl": "/@bundle.js", "sourceMapUrl": "/@bundle.js.map"}"#,
    )
    .unwrap();
    let server = DevServer::start(dir.path(), &[]);

    let bundle = reqwest::get(server.url("/@bundle.js")).await.unwrap();
    assert_eq!(bundle.status(), 200);
    let bundle = bundle.text().await.unwrap();
    assert!(bundle.contains("//# sourceMappingURL=/@bundle.js.map?v="));
}
