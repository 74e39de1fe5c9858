//! Request handling: classify the URL, apply policy, redirect to canonical
//! form, probe the artefact store, or wait on the build queue.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tracing::debug;

use esmcdn_build::polyfills::embedded_polyfill;
use esmcdn_build::{Loader, TransformRequest};
use esmcdn_common::{
    is_commitish, is_exact_version, target_from_user_agent, BuildArgs, BuildResult, CdnError, Pkg,
    PkgOrigin, Target, BUILD_VERSION,
};
use esmcdn_identity::{
    decode_args_prefix, parse_module_path, parse_query, parse_target_segment, BuildIdentity,
    ModulePath, QueryOptions,
};

use crate::cache;
use crate::state::AppState;
use crate::wrapper::module_wrapper;

pub const JS_TYPE: &str = "application/javascript; charset=utf-8";
pub const DTS_TYPE: &str = "application/typescript; charset=utf-8";
pub const CSS_TYPE: &str = "text/css; charset=utf-8";
pub const MAP_TYPE: &str = "application/json; charset=utf-8";

// --- Meta routes ---

pub async fn home() -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, cache::REVALIDATE)],
        "esmcdn — a transforming CDN for ES modules\n",
    )
}

pub async fn favicon() -> Response {
    plain_status(StatusCode::NOT_FOUND, "not found")
}

pub async fn status_json(State(state): State<Arc<AppState>>) -> Response {
    let queue = state.queue.status().await;
    let body = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildVersion": BUILD_VERSION,
        "uptime": state.started_at.elapsed().as_secs(),
        "queue": queue,
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
        .header(header::CACHE_CONTROL, cache::REVALIDATE)
        .body(Body::from(body.to_string()))
        .expect("static response")
}

pub async fn esma_target(headers: HeaderMap) -> Response {
    let target = infer_target(&headers);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, cache::REVALIDATE)
        .header(header::VARY, "User-Agent")
        .body(Body::from(target.as_str().to_string()))
        .expect("static response")
}

#[derive(Debug, Deserialize)]
pub struct ErrorJsQuery {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub importer: String,
}

/// A JS module that throws at evaluation time. Served with a 200 so the
/// importing module graph loads and surfaces the message in the console.
pub async fn error_js(Query(query): Query<ErrorJsQuery>) -> Response {
    let mut message = format!("[esm.sh] {}", query.error_type);
    if !query.name.is_empty() {
        message.push_str(&format!(": {}", query.name));
    }
    if !query.importer.is_empty() {
        message.push_str(&format!(" (imported by {})", query.importer));
    }
    let body = format!("throw new Error({});\n", serde_json::json!(message));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, JS_TYPE)
        .header(header::CACHE_CONTROL, cache::TEN_MINUTES)
        .body(Body::from(body))
        .expect("static response")
}

/// Embedded Node-global polyfill modules (`/node/buffer.mjs`).
pub async fn node_polyfill(Path(file): Path<String>) -> Response {
    let Some(name) = file.strip_suffix(".mjs") else {
        return plain_status(StatusCode::NOT_FOUND, "not found");
    };
    match embedded_polyfill(name) {
        Some(contents) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, JS_TYPE)
            .header(header::CACHE_CONTROL, cache::IMMUTABLE)
            .body(Body::from(contents))
            .expect("static response"),
        None => plain_status(StatusCode::NOT_FOUND, "not found"),
    }
}

#[derive(Debug, Deserialize)]
pub struct TransformBody {
    pub code: String,
    #[serde(default)]
    pub loader: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(rename = "importMap", default)]
    pub import_map: Option<serde_json::Value>,
}

/// One-shot transform, cached by SHA-1 of the input.
pub async fn transform(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TransformBody>,
) -> Response {
    let loader = match body.loader.as_deref().unwrap_or("js") {
        "js" => Loader::Js,
        "jsx" => Loader::Jsx,
        "ts" => Loader::Ts,
        "tsx" => Loader::Tsx,
        other => {
            return respond_error(CdnError::InvalidRequest(format!("unknown loader: {other}")), false)
        }
    };
    let target = match body.target.as_deref() {
        None => Target::EsNext,
        Some(raw) => match Target::parse(raw) {
            Some(target) => target,
            None => {
                return respond_error(CdnError::InvalidRequest(format!("unknown target: {raw}")), false)
            }
        },
    };

    let mut hasher = Sha1::new();
    hasher.update(body.code.as_bytes());
    hasher.update(body.loader.as_deref().unwrap_or("js").as_bytes());
    if let Some(map) = &body.import_map {
        hasher.update(map.to_string().as_bytes());
    }
    let sha1 = format!("{:x}", hasher.finalize());
    let path = format!("modules/{sha1}.{}.mjs", target.as_str());

    if let Ok(cached) = state.storage.open(&path).await {
        let code = String::from_utf8_lossy(&cached).into_owned();
        return Json(serde_json::json!({"code": code})).into_response();
    }

    let transformed = state
        .bundler
        .transform(TransformRequest {
            code: body.code,
            loader,
            target,
            import_map: body.import_map,
        })
        .await;
    match transformed {
        Ok(code) => {
            if let Err(e) = state
                .storage
                .write(&path, bytes::Bytes::from(code.clone().into_bytes()))
                .await
            {
                debug!(error = %e, "Transform cache write failed");
            }
            Json(serde_json::json!({"code": code})).into_response()
        }
        Err(e) => respond_error(e, false),
    }
}

#[derive(Debug, Deserialize)]
pub struct PurgeBody {
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub github: Option<bool>,
    #[serde(rename = "zoneId", default)]
    pub zone_id: Option<String>,
}

/// Delete artefacts and metadata under the computed prefix. Purging a
/// prefix twice is a no-op, not an error.
pub async fn purge(State(state): State<Arc<AppState>>, Json(body): Json<PurgeBody>) -> Response {
    let Some(package) = body.package.filter(|p| !p.is_empty()) else {
        return respond_error(CdnError::InvalidRequest("missing package".into()), false);
    };
    let name = if body.github.unwrap_or(false) {
        format!("gh/{package}")
    } else {
        package
    };
    let suffix = body
        .version
        .map(|v| format!("@{v}"))
        .unwrap_or_else(|| "@".to_string());

    let mut deleted = 0u64;
    for root in ["builds", "types"] {
        for v in 1..=BUILD_VERSION {
            let prefix = format!("{root}/v{v}/{name}{suffix}");
            deleted += state.storage.delete_prefix(&prefix).await.unwrap_or(0);
            let _ = state.kv.delete_prefix(&prefix).await;
        }
    }
    Json(serde_json::json!({"deleted": deleted, "zoneId": body.zone_id})).into_response()
}

// --- The module fallback ---

pub async fn module_request(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    let headers = req.headers().clone();
    let uri = req.uri().clone();
    let mut path = uri.path().to_string();

    // Base-path prefix: strip, or redirect requests missing it.
    let base = state.config.base_path.clone();
    if !base.is_empty() {
        match path.strip_prefix(&base) {
            Some(rest) if rest.is_empty() => path = "/".to_string(),
            Some(rest) => path = rest.to_string(),
            None => {
                let location = format!("{base}{path}");
                return redirect(&location, uri.query());
            }
        }
    }

    // User-uploaded transform outputs: `/+<sha1>.mjs`.
    if let Some(rest) = path.strip_prefix("/+") {
        return serve_user_module(&state, rest, &headers).await;
    }

    // Types artefacts are served straight from storage.
    if let Some(rest) = path.strip_prefix("/types/") {
        return serve_types(&state, rest).await;
    }

    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(
        uri.query().unwrap_or_default().as_bytes(),
    )
    .into_owned()
    .collect();
    let opts = match parse_query(&pairs) {
        Ok(opts) => opts,
        Err(e) => return respond_error(e, false),
    };
    let parsed = match parse_module_path(&path) {
        Ok(parsed) => parsed,
        Err(e) => return respond_error(e, false),
    };

    if let Err(e) = state.policy.check(&parsed.name) {
        return respond_error(e, false);
    }

    let build_version = opts.pin.or(parsed.build_version).unwrap_or(BUILD_VERSION);
    if build_version > BUILD_VERSION || build_version == 0 {
        return respond_error(
            CdnError::InvalidRequest(format!("unknown build version v{build_version}")),
            false,
        );
    }

    let pinned = match parsed.origin {
        PkgOrigin::CodeHost => is_commitish(&parsed.version_spec),
        _ => is_exact_version(&parsed.version_spec),
    };

    // Canonical artefact URLs at exact versions never touch the resolver.
    if pinned {
        if let Some(segment) = parse_target_segment(&parsed.sub_path) {
            return serve_artefact(&state, &parsed, build_version, segment).await;
        }
    }

    // Unpinned specs resolve upstream and redirect to the pinned form.
    // Pinned requests skip the resolver entirely, so cached identities keep
    // serving when the registry is unreachable.
    if !pinned {
        let resolved = match state
            .resolver
            .resolve(parsed.origin, &parsed.name, &parsed.version_spec)
            .await
        {
            Ok(resolved) => resolved,
            Err(e) => return respond_error(e, true),
        };
        let mut location = String::new();
        if parsed.stable {
            location.push_str("/stable");
        } else if parsed.build_version.is_some() {
            location.push_str(&format!("/v{build_version}"));
        }
        if parsed.origin == PkgOrigin::CodeHost {
            location.push_str("/gh");
        }
        location.push_str(&format!("/{}@{}", parsed.name, resolved.version));
        if !parsed.sub_path.is_empty() {
            location.push('/');
            location.push_str(&parsed.sub_path);
        }
        let location = format!("{base}{location}");
        return redirect(&location, uri.query());
    }

    let mut pkg = Pkg::new(parsed.name.clone(), parsed.version_spec.clone());
    pkg.origin = parsed.origin;
    let sub_path = opts
        .sub_path
        .clone()
        .unwrap_or_else(|| parsed.sub_path.clone());
    if !sub_path.is_empty() {
        pkg = pkg.with_sub_path(&sub_path);
    }

    // Raw source files bypass the pipeline entirely.
    if opts.raw || is_raw_asset(&pkg.sub_path) {
        return serve_raw(&state, &pkg).await;
    }

    let mut args = opts.args.clone();
    if parsed.external_all {
        args.external_all = true;
    }
    let (target, ua_inferred) = match opts.target {
        Some(target) => (target, false),
        None => (infer_target(&headers), true),
    };

    let identity = BuildIdentity::new(build_version, pkg, args, target);
    let prefixed = parsed.stable || parsed.build_version.is_some();
    serve_module(&state, &headers, identity, &opts, prefixed, ua_inferred).await
}

/// Serve a bare module request: cache probe, queue wait, wrapper emission.
async fn serve_module(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    identity: BuildIdentity,
    opts: &QueryOptions,
    prefixed: bool,
    ua_inferred: bool,
) -> Response {
    let key = identity.key();

    let cached: Option<BuildResult> = match state.kv.get(&key).await {
        Ok(Some(value)) => serde_json::from_value(value).ok(),
        _ => None,
    };

    let result = match cached {
        Some(result) => result,
        None => {
            let requester = requester_id(headers);
            let handle = state.queue.add(identity.clone(), &requester).await;
            let outcome = state.queue.wait(handle).await;
            match outcome.as_ref() {
                Ok(result) => result.clone(),
                Err(e) => return respond_error_ref(e, true, prefixed),
            }
        }
    };

    if opts.css {
        if !result.package_css {
            return respond_error(
                CdnError::NotFound(format!("{} has no css artefact", identity.pkg.spec())),
                false,
            );
        }
        let css_url = format!("/{}", identity.artefact_path("css"));
        return redirect(&css_url, None);
    }

    let artefact_url = identity.url_path();
    let body = module_wrapper(&artefact_url, &result, identity.args.worker);

    let cache_control = if prefixed { cache::IMMUTABLE } else { cache::TEN_MINUTES };
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, JS_TYPE)
        .header(header::CACHE_CONTROL, cache_control)
        .header("X-Esm-Path", &artefact_url);
    if let Some(dts) = &result.dts {
        response = response.header("X-Typescript-Types", format!("/{dts}"));
    }
    if ua_inferred {
        response = response.header(header::VARY, "User-Agent");
    }
    response.body(Body::from(body)).expect("wrapper response")
}

/// Serve a canonical target-segment URL from storage, building on miss.
async fn serve_artefact(
    state: &Arc<AppState>,
    parsed: &ModulePath,
    build_version: u32,
    segment: esmcdn_identity::TargetSegment,
) -> Response {
    let mut args = match &segment.args_prefix {
        Some(prefix) => match decode_args_prefix(prefix) {
            Ok(args) => args,
            Err(e) => return respond_error(e, false),
        },
        None => BuildArgs::default(),
    };
    args.dev = segment.dev;
    if let Some(mode) = segment.bundle_mode {
        args.bundle_mode = mode;
    }
    if parsed.external_all {
        args.external_all = true;
    }

    let mut pkg = Pkg::new(parsed.name.clone(), parsed.version_spec.clone());
    pkg.origin = parsed.origin;
    let base_name = pkg.name.rsplit('/').next().unwrap_or(&pkg.name).to_string();
    if segment.module != base_name {
        pkg.sub_path = segment.module.clone();
        pkg.sub_module = segment.module.clone();
    }

    let identity = BuildIdentity::new(build_version, pkg, args, segment.target);
    let (path, content_type) = match segment.ext.as_str() {
        "css" => (identity.artefact_path("css"), CSS_TYPE),
        "map" => (identity.artefact_path("map"), MAP_TYPE),
        _ => (identity.artefact_path("mjs"), JS_TYPE),
    };

    if let Ok(data) = state.storage.open(&path).await {
        return artefact_response(state, &identity, data, content_type).await;
    }

    // Cache miss: build, then read back what the job persisted.
    let handle = state.queue.add(identity.clone(), "").await;
    let outcome = state.queue.wait(handle).await;
    if let Err(e) = outcome.as_ref() {
        return respond_error_ref(e, true, true);
    }
    match state.storage.open(&path).await {
        Ok(data) => artefact_response(state, &identity, data, content_type).await,
        Err(e) => respond_error_ref(&e, true, true),
    }
}

async fn artefact_response(
    state: &Arc<AppState>,
    identity: &BuildIdentity,
    data: bytes::Bytes,
    content_type: &str,
) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, cache::IMMUTABLE)
        .header("X-Esm-Path", identity.url_path());
    if content_type == JS_TYPE {
        if let Ok(Some(value)) = state.kv.get(&identity.key()).await {
            if let Some(dts) = value.get("dts").and_then(|v| v.as_str()) {
                response = response.header("X-Typescript-Types", format!("/{dts}"));
            }
        }
    }
    response.body(Body::from(data)).expect("artefact response")
}

/// Stream a raw source file out of the installed package tree.
async fn serve_raw(state: &Arc<AppState>, pkg: &Pkg) -> Response {
    if pkg.sub_path.is_empty() {
        return respond_error(CdnError::InvalidRequest("raw requests need a file path".into()), false);
    }
    let meta = match pkg.origin {
        PkgOrigin::CodeHost => Default::default(),
        _ => match state
            .resolver
            .resolve(pkg.origin, &pkg.name, &pkg.version)
            .await
        {
            Ok(resolved) => resolved.meta,
            Err(e) => return respond_error(e, false),
        },
    };
    let installed = match state.installer.install(pkg, &meta).await {
        Ok(installed) => installed,
        Err(e) => return respond_error(e, false),
    };
    let file = installed.root.join(&pkg.sub_path);
    match tokio::fs::read(&file).await {
        Ok(data) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, raw_content_type(&pkg.sub_path))
            .header(header::CACHE_CONTROL, cache::IMMUTABLE)
            .body(Body::from(data))
            .expect("raw response"),
        Err(_) => respond_error(CdnError::NotFound(format!("{}/{}", pkg.spec(), pkg.sub_path)), false),
    }
}

async fn serve_types(state: &Arc<AppState>, rest: &str) -> Response {
    let path = format!("types/{rest}");
    match state.storage.open(&path).await {
        Ok(data) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, DTS_TYPE)
            .header(header::CACHE_CONTROL, cache::IMMUTABLE)
            .body(Body::from(data))
            .expect("types response"),
        Err(e) => respond_error(e, false),
    }
}

async fn serve_user_module(state: &Arc<AppState>, rest: &str, headers: &HeaderMap) -> Response {
    let Some(sha1) = rest.strip_suffix(".mjs") else {
        return respond_error(CdnError::InvalidRequest(format!("bad module path: {rest}")), false);
    };
    if sha1.len() != 40 || !sha1.chars().all(|c| c.is_ascii_hexdigit()) {
        return respond_error(CdnError::InvalidRequest(format!("bad module hash: {sha1}")), false);
    }
    let target = infer_target(headers);
    let path = format!("modules/{sha1}.{}.mjs", target.as_str());
    match state.storage.open(&path).await {
        Ok(data) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, JS_TYPE)
            .header(header::CACHE_CONTROL, cache::IMMUTABLE)
            .header(header::VARY, "User-Agent")
            .body(Body::from(data))
            .expect("user module response"),
        Err(e) => respond_error(e, false),
    }
}

// --- Helpers ---

fn infer_target(headers: &HeaderMap) -> Target {
    let ua = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    target_from_user_agent(ua)
}

fn requester_id(headers: &HeaderMap) -> String {
    for name in ["x-real-ip", "x-forwarded-for"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if let Some(first) = value.split(',').next() {
                return first.trim().to_string();
            }
        }
    }
    String::new()
}

fn redirect(location: &str, query: Option<&str>) -> Response {
    let location = match query {
        Some(query) if !query.is_empty() => format!("{location}?{query}"),
        _ => location.to_string(),
    };
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, &location)
        .header(header::CACHE_CONTROL, cache::TEN_MINUTES)
        .body(Body::empty())
        .expect("redirect response")
}

/// Paths with a non-module extension (assets) are served raw.
fn is_raw_asset(sub_path: &str) -> bool {
    let Some((_, ext)) = sub_path.rsplit_once('.') else {
        return false;
    };
    !matches!(
        ext,
        "js" | "mjs" | "cjs" | "jsx" | "ts" | "mts" | "cts" | "tsx" | "css" | "json"
    ) && !ext.contains('/')
}

fn raw_content_type(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("json") => "application/json; charset=utf-8",
        Some("css") => CSS_TYPE,
        Some("html") => "text/html; charset=utf-8",
        Some("txt") | Some("md") => "text/plain; charset=utf-8",
        Some("wasm") => "application/wasm",
        Some("js") | Some("mjs") | Some("cjs") => JS_TYPE,
        _ => "application/octet-stream",
    }
}

fn plain_status(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CACHE_CONTROL, cache::REVALIDATE)
        .body(Body::from(message.to_string()))
        .expect("status response")
}

/// Map a pipeline error onto HTTP. Build failures of module requests come
/// back as a JS module that throws, so browser importers see the message.
pub fn respond_error(err: CdnError, module_shaped: bool) -> Response {
    respond_error_ref(&err, module_shaped, false)
}

/// `immutable` marks requests that would have been served immutable on
/// success: their evaluation-error bodies keep a ten-minute cache so a
/// failing build is not re-driven on every fetch.
pub fn respond_error_ref(err: &CdnError, module_shaped: bool, immutable: bool) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if module_shaped && err.as_module_evaluation_error() {
        let body = format!("throw new Error({});\n", serde_json::json!(format!("[esm.sh] {err}")));
        let cache_control = if immutable { cache::TEN_MINUTES } else { cache::NO_STORE };
        return Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, JS_TYPE)
            .header(header::CACHE_CONTROL, cache_control)
            .body(Body::from(body))
            .expect("error response");
    }
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, if status.is_server_error() {
            cache::NO_STORE
        } else {
            cache::REVALIDATE
        })
        .body(Body::from(err.to_string()))
        .expect("error response")
}
