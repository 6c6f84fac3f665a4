//! Materialization of images from build configurations.

use std::{
    io::{self, IsTerminal},
    sync::mpsc,
};

use log::{debug, info, warn};

use crate::{
    auth::AuthConfigs,
    config::{BuildConfig, LoadConfig},
    context::{self, BuildContext},
    engine::{BuildRequest, Engine},
    id,
    message::{self, TraceForwarder},
    progress::{PlainRenderer, Render},
    session::{Session, SESSION_ENDPOINT},
    task::{self, CancellationToken},
    Error,
};

/// Number of solve events that may be waiting for the renderer before the decoder blocks.
const TRACE_CHANNEL_CAPACITY: usize = 64;

/// An image described by a build configuration.
pub struct Image<'a> {
    engine: &'a dyn Engine,
    configs: &'a dyn LoadConfig,
    auth_configs: &'a AuthConfigs,
    config: BuildConfig,
    cancel: &'a CancellationToken,
    renderer: Option<&'a dyn Render>,
}

impl<'a> Image<'a> {
    /// Progress is rendered to stderr when it is a terminal.
    pub fn new(
        engine: &'a dyn Engine,
        configs: &'a dyn LoadConfig,
        auth_configs: &'a AuthConfigs,
        config: BuildConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        let renderer: Option<&'a dyn Render> = if io::stderr().is_terminal() {
            Some(&PlainRenderer)
        } else {
            None
        };
        Self {
            engine,
            configs,
            auth_configs,
            config,
            cancel,
            renderer,
        }
    }

    #[cfg(test)]
    fn with_renderer(self, renderer: Option<&'a dyn Render>) -> Self {
        Self { renderer, ..self }
    }

    /// Returns the id of the existing image with the configured name, and builds the image if there
    /// is none or a rebuild is forced.
    pub fn get(&self) -> Result<String, Error> {
        self.get_within(&mut Vec::new())
    }

    /// Builds the image after materializing its dependencies, and returns its id.
    pub fn build(&self) -> Result<String, Error> {
        self.build_within(&mut Vec::new())
    }

    fn display_name(&self) -> &str {
        self.config
            .image_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.config.name)
    }

    /// `chain` holds the names of the configurations currently being built, outermost first.
    fn get_within(&self, chain: &mut Vec<String>) -> Result<String, Error> {
        if !self.config.force_rebuild {
            if let Some(name) = self.config.image_name.as_deref().filter(|n| !n.is_empty()) {
                match self.engine.image_list(name) {
                    Ok(images) => {
                        if let Some(image) = images.into_iter().find(|image| !image.id.is_empty()) {
                            info!("Using existing image {name} ({})", image.id);
                            return Ok(image.id);
                        }
                        debug!("no image named {name:?}, building it");
                    }
                    Err(error) => warn!("Failed to look up image {name:?}, building it: {error}"),
                }
            }
        }

        self.build_within(chain)
    }

    fn build_within(&self, chain: &mut Vec<String>) -> Result<String, Error> {
        if let Some(position) = chain.iter().position(|name| *name == self.config.name) {
            let mut cycle = chain[position..].to_vec();
            cycle.push(self.config.name.clone());
            return Err(Error::DependencyCycle(cycle));
        }

        chain.push(self.config.name.clone());
        let result = self
            .materialize_dependencies(chain)
            .and_then(|()| self.build_self());
        chain.pop();
        result
    }

    fn materialize_dependencies(&self, chain: &mut Vec<String>) -> Result<(), Error> {
        for dependency in &self.config.dependencies {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut config = self.configs.load_image(dependency).map_err(Error::Config)?;
            config.force_rebuild |= self.config.force_rebuild;

            let image = Image { config, ..*self };
            let id = image.get_within(chain)?;
            debug!("dependency {dependency} of {} is {id}", self.config.name);
        }
        Ok(())
    }

    fn build_self(&self) -> Result<String, Error> {
        info!("Building image {}", self.display_name());

        let context = context::prepare(&self.config).map_err(Error::Context)?;
        let session = Session::new(&self.config.name, &self.config.name);

        let id = self.run_build(&session, &context)?;
        if id.is_empty() {
            return Err(Error::MissingImageId);
        }

        info!("Built image {} ({id})", self.display_name());
        Ok(id)
    }

    /// Runs the session tunnel, the build with its output decoder and, when rebuilding on a
    /// terminal, the progress renderer. Returns the image id reported by the engine, which may be
    /// empty.
    pub(crate) fn run_build(
        &self,
        session: &Session,
        context: &BuildContext,
    ) -> Result<String, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let request = BuildRequest {
            tags: self
                .config
                .image_name
                .iter()
                .filter(|name| !name.is_empty())
                .cloned()
                .collect(),
            build_args: self.config.args.clone(),
            no_cache: self.config.no_cache,
            pull_parent: self.config.force_pull,
            dockerfile: context.dockerfile().to_owned(),
            remote_context: context.remote().map(str::to_owned),
            session_id: session.id().to_owned(),
            build_id: id::random_id(),
            auth_configs: self.auth_configs.clone(),
        };
        let archive = context.archive().map_err(Error::Context)?;
        let renderer = self.renderer.filter(|_| self.config.force_rebuild);

        let image_id = task::join(self.cancel, |group| {
            let token = group.token().clone();

            group.spawn("session", {
                let token = token.clone();
                move || {
                    session.run(
                        |proto, metadata| self.engine.dial_hijack(SESSION_ENDPOINT, proto, metadata),
                        &token,
                    )
                }
            });

            let mut trace = TraceForwarder::disabled();
            if let Some(renderer) = renderer {
                let (sender, receiver) = mpsc::sync_channel(TRACE_CHANNEL_CAPACITY);
                trace = TraceForwarder::new(Some(sender));
                group.spawn("progress", move || renderer.render(receiver));
            }

            let build = group.spawn("build", move || {
                let mut teardown = Teardown { trace, session };
                let output = self
                    .engine
                    .image_build(&request, archive)
                    .map_err(Error::Request)?;
                message::decode_build_output(output, &mut teardown.trace, &token)
            });

            build.join()
        })?;

        Ok(image_id.unwrap_or_default())
    }
}

/// Ends the progress stream and then the session once the build is over, however it ended.
struct Teardown<'s> {
    trace: TraceForwarder,
    session: &'s Session,
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        self.trace.close();
        if self.session.close() {
            debug!("closed session {}", self.session.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        fs,
        io::Read,
        path::Path,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        thread,
        time::Duration,
    };

    use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
    use prost::Message as _;
    use rand::Rng;

    use super::*;
    use crate::{
        config::ConfigFile,
        engine::ImageSummary,
        session::{tests::FakeConnection, Connection, Metadata},
        trace::{proto, SolveEvent},
        BoxError,
    };

    #[derive(Clone)]
    enum Output {
        Stream(String),
        Rejected(&'static str),
    }

    #[derive(Default)]
    struct FakeEngine {
        /// Build output by image name.
        outputs: BTreeMap<String, Output>,
        existing: BTreeMap<String, String>,
        list_fails: bool,
        dial_delay: Duration,
        dial_fails: bool,
        build_delay: Duration,
        submitted: Mutex<Vec<BuildRequest>>,
        connections: Mutex<Vec<FakeConnection>>,
    }

    impl FakeEngine {
        fn output(mut self, name: &str, output: Output) -> Self {
            self.outputs.insert(name.to_owned(), output);
            self
        }

        fn submitted_tags(&self) -> Vec<String> {
            self.submitted
                .lock()
                .unwrap()
                .iter()
                .flat_map(|request| request.tags.clone())
                .collect()
        }
    }

    /// Delays the first read.
    struct SlowReader {
        delay: Option<Duration>,
        inner: io::Cursor<Vec<u8>>,
    }

    impl Read for SlowReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(delay) = self.delay.take() {
                thread::sleep(delay);
            }
            self.inner.read(buf)
        }
    }

    impl Engine for FakeEngine {
        fn image_build(
            &self,
            request: &BuildRequest,
            _context: Option<fs::File>,
        ) -> Result<Box<dyn Read + Send>, BoxError> {
            self.submitted.lock().unwrap().push(request.clone());
            let name = request.tags.first().cloned().unwrap_or_default();
            match self.outputs.get(&name).cloned() {
                Some(Output::Stream(output)) => Ok(Box::new(SlowReader {
                    delay: Some(self.build_delay),
                    inner: io::Cursor::new(output.into_bytes()),
                })),
                Some(Output::Rejected(message)) => Err(message.into()),
                None => Ok(Box::new(io::empty())),
            }
        }

        fn dial_hijack(
            &self,
            endpoint: &str,
            proto: &str,
            metadata: &Metadata,
        ) -> Result<Box<dyn Connection>, BoxError> {
            assert_eq!(endpoint, SESSION_ENDPOINT);
            assert_eq!(proto, "h2c");
            assert!(metadata.contains_key("X-Docker-Expose-Session-Uuid"));
            thread::sleep(self.dial_delay);
            if self.dial_fails {
                return Err("connection refused".into());
            }
            let connection = FakeConnection::default();
            self.connections.lock().unwrap().push(connection.clone());
            Ok(connection.connect())
        }

        fn image_list(&self, reference: &str) -> Result<Vec<ImageSummary>, BoxError> {
            if self.list_fails {
                return Err("engine unavailable".into());
            }
            Ok(self
                .existing
                .get(reference)
                .map(|id| ImageSummary {
                    id: id.clone(),
                    repo_tags: Some(vec![reference.to_owned()]),
                    created: 0,
                    size: 0,
                })
                .into_iter()
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeRenderer {
        fails: bool,
        delay: Duration,
        received: AtomicUsize,
        finished: AtomicUsize,
    }

    impl Render for FakeRenderer {
        fn render(&self, events: mpsc::Receiver<SolveEvent>) -> Result<(), Error> {
            thread::sleep(self.delay);
            if self.fails {
                return Err(Error::Render(io::Error::other("terminal gone")));
            }
            for _ in events {
                self.received.fetch_add(1, Ordering::SeqCst);
            }
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn image_id_record(id: &str) -> String {
        format!(r#"{{"id":"moby.image.id","aux":{{"ID":"{id}"}}}}"#)
    }

    fn trace_record(name: &str) -> String {
        let response = proto::StatusResponse {
            vertexes: vec![proto::Vertex {
                digest: format!("sha256:{name}"),
                name: name.to_owned(),
                ..Default::default()
            }],
            ..Default::default()
        };
        format!(
            r#"{{"id":"moby.buildkit.trace","aux":"{}"}}"#,
            BASE64_STANDARD.encode(response.encode_to_vec())
        )
    }

    fn success(id: &str) -> Output {
        Output::Stream(format!(
            "{}\n{}\n{{\"stream\":\"Step 1/1\\n\"}}\n{}\n",
            trace_record("one"),
            trace_record("two"),
            image_id_record(id)
        ))
    }

    const CONFIGS: &str = r#"
images:
  base:
    name: example/base
    context: https://example.com/base.git
  app:
    name: example/app
    context: https://example.com/app.git
    dockerfile: build/Dockerfile
    args:
      VERSION: "1.0"
    pull: true
    dependencies: [base]
  loop-a:
    context: https://example.com/a.git
    dependencies: [loop-b]
  loop-b:
    context: https://example.com/b.git
    dependencies: [loop-a]
"#;

    fn configs() -> ConfigFile {
        ConfigFile::parse(CONFIGS, Path::new("")).unwrap()
    }

    fn image<'a>(
        engine: &'a FakeEngine,
        configs: &'a ConfigFile,
        name: &str,
        cancel: &'a CancellationToken,
    ) -> Image<'a> {
        static NO_AUTH: AuthConfigs = AuthConfigs::new();
        Image::new(
            engine,
            configs,
            &NO_AUTH,
            configs.load_image(name).unwrap(),
            cancel,
        )
        .with_renderer(None)
    }

    #[test]
    fn builds_dependencies_first() {
        let engine = FakeEngine::default()
            .output("example/base", success("sha256:base"))
            .output("example/app", success("sha256:app"));
        let configs = configs();
        let cancel = CancellationToken::new();

        let id = image(&engine, &configs, "app", &cancel).build().unwrap();
        assert_eq!(id, "sha256:app");
        assert_eq!(engine.submitted_tags(), ["example/base", "example/app"]);

        let submitted = engine.submitted.lock().unwrap();
        let app = &submitted[1];
        assert_eq!(app.dockerfile, "build/Dockerfile");
        assert_eq!(app.remote_context.as_deref(), Some("https://example.com/app.git"));
        assert_eq!(app.build_args["VERSION"].as_deref(), Some("1.0"));
        assert!(app.pull_parent);
        assert_eq!(app.session_id.len(), 64);
        assert_ne!(app.session_id, submitted[0].session_id);
        assert_ne!(app.build_id, app.session_id);

        // A session is only dialed if it is still open when its task starts.
        for connection in engine.connections.lock().unwrap().iter() {
            assert_eq!(connection.close_count(), 1);
        }
    }

    #[test]
    fn missing_image_id() {
        let engine = FakeEngine::default().output("example/base", Output::Stream(String::new()));
        let configs = configs();
        let cancel = CancellationToken::new();

        let error = image(&engine, &configs, "base", &cancel).build().unwrap_err();
        assert!(matches!(error, Error::MissingImageId), "{error}");
    }

    #[test]
    fn failed_dependency_stops_the_build() {
        let engine = FakeEngine::default()
            .output(
                "example/base",
                Output::Stream(r#"{"error":{"message":"no space left on device"}}"#.to_owned()),
            )
            .output("example/app", success("sha256:app"));
        let configs = configs();
        let cancel = CancellationToken::new();

        let error = image(&engine, &configs, "app", &cancel).build().unwrap_err();
        assert!(matches!(error, Error::Engine(_)), "{error}");
        assert_eq!(error.to_string(), "no space left on device");
        assert_eq!(engine.submitted_tags(), ["example/base"]);
    }

    #[test]
    fn get_reuses_existing_image() {
        let mut engine = FakeEngine::default().output("example/app", success("sha256:new"));
        engine
            .existing
            .insert("example/base".to_owned(), "sha256:existing-base".to_owned());
        let configs = configs();
        let cancel = CancellationToken::new();

        assert_eq!(
            image(&engine, &configs, "base", &cancel).get().unwrap(),
            "sha256:existing-base"
        );
        assert_eq!(
            image(&engine, &configs, "app", &cancel).get().unwrap(),
            "sha256:new"
        );
        assert_eq!(engine.submitted_tags(), ["example/app"]);
    }

    #[test]
    fn get_builds_when_lookup_fails() {
        let engine = FakeEngine {
            list_fails: true,
            ..FakeEngine::default().output("example/base", success("sha256:base"))
        };
        let configs = configs();
        let cancel = CancellationToken::new();

        assert_eq!(
            image(&engine, &configs, "base", &cancel).get().unwrap(),
            "sha256:base"
        );
    }

    #[test]
    fn force_rebuild_applies_to_dependencies() {
        let mut engine = FakeEngine::default()
            .output("example/base", success("sha256:base"))
            .output("example/app", success("sha256:app"));
        engine
            .existing
            .insert("example/base".to_owned(), "sha256:old-base".to_owned());
        engine
            .existing
            .insert("example/app".to_owned(), "sha256:old-app".to_owned());
        let configs = configs();
        let cancel = CancellationToken::new();
        let renderer = FakeRenderer::default();
        let auth_configs = AuthConfigs::new();

        let mut config = configs.load_image("app").unwrap();
        config.force_rebuild = true;
        let image = Image::new(&engine, &configs, &auth_configs, config, &cancel)
            .with_renderer(Some(&renderer));

        assert_eq!(image.get().unwrap(), "sha256:app");
        assert_eq!(engine.submitted_tags(), ["example/base", "example/app"]);
        // Two trace records per build.
        assert_eq!(renderer.received.load(Ordering::SeqCst), 4);
        assert_eq!(renderer.finished.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn renderer_only_runs_when_rebuilding() {
        let engine = FakeEngine::default().output("example/base", success("sha256:base"));
        let configs = configs();
        let cancel = CancellationToken::new();
        let renderer = FakeRenderer::default();

        let image = image(&engine, &configs, "base", &cancel).with_renderer(Some(&renderer));
        assert_eq!(image.build().unwrap(), "sha256:base");
        assert_eq!(renderer.finished.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dependency_cycle() {
        let engine = FakeEngine::default();
        let configs = configs();
        let cancel = CancellationToken::new();

        let error = image(&engine, &configs, "loop-a", &cancel).build().unwrap_err();
        assert_eq!(
            error.to_string(),
            "image dependencies form a cycle: loop-a -> loop-b -> loop-a"
        );
        assert!(engine.submitted_tags().is_empty());
    }

    #[test]
    fn unknown_dependency() {
        let engine = FakeEngine::default();
        let configs = ConfigFile::parse(
            "images:\n  app:\n    context: https://example.com/app.git\n    dependencies: [nope]\n",
            Path::new(""),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        let error = image(&engine, &configs, "app", &cancel).build().unwrap_err();
        assert!(matches!(error, Error::Config(_)), "{error}");
    }

    #[test]
    fn rejected_build_request() {
        let engine =
            FakeEngine::default().output("example/base", Output::Rejected("engine is busy"));
        let configs = configs();
        let cancel = CancellationToken::new();

        let error = image(&engine, &configs, "base", &cancel).build().unwrap_err();
        assert_eq!(error.to_string(), "build engine request failed: engine is busy");
    }

    #[test]
    fn cancelled_before_build() {
        let engine = FakeEngine::default().output("example/base", success("sha256:base"));
        let configs = configs();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = image(&engine, &configs, "base", &cancel).build().unwrap_err();
        assert!(matches!(error, Error::Cancelled), "{error}");
        assert!(engine.submitted_tags().is_empty());
    }

    #[test]
    fn teardown_happens_once_in_any_order() {
        let configs = configs();
        let auth_configs = AuthConfigs::new();
        let mut rng = rand::thread_rng();
        let mut micros = || Duration::from_micros(rng.gen_range(0..300));

        for _ in 0..1000 {
            let dial_fails = rand::random::<f64>() < 0.2;
            let build_fails = rand::random::<f64>() < 0.2;
            let renderer_fails = rand::random::<f64>() < 0.2;

            let output = if build_fails {
                Output::Stream(format!(
                    "{}\n{{\"error\":\"step failed\"}}\n",
                    trace_record("one")
                ))
            } else {
                success("sha256:base")
            };
            let engine = FakeEngine {
                dial_delay: micros(),
                dial_fails,
                build_delay: micros(),
                ..FakeEngine::default().output("example/base", output)
            };
            let renderer = FakeRenderer {
                fails: renderer_fails,
                delay: micros(),
                ..Default::default()
            };
            let cancel = CancellationToken::new();

            let mut config = configs.load_image("base").unwrap();
            config.force_rebuild = true;
            let image = Image::new(&engine, &configs, &auth_configs, config, &cancel)
                .with_renderer(Some(&renderer));
            let context = context::prepare(&image.config).unwrap();
            let session = Session::new("base", "base");

            let result = image.run_build(&session, &context);

            match &result {
                Ok(id) => {
                    assert!(!dial_fails && !build_fails && !renderer_fails);
                    assert_eq!(id, "sha256:base");
                }
                Err(Error::Session(_)) => assert!(dial_fails),
                Err(Error::Engine(error)) => {
                    assert!(build_fails);
                    assert_eq!(error.message, "step failed");
                }
                Err(Error::Render(_)) => assert!(renderer_fails),
                Err(error) => panic!("unexpected error: {error}"),
            }
            if !dial_fails && !build_fails && !renderer_fails {
                assert!(result.is_ok());
            }

            // The decoder closed the session, nothing is left to close.
            assert!(session.is_closed());
            assert!(!session.close());
            // Every connection that was dialed has been dropped, exactly once.
            for connection in engine.connections.lock().unwrap().iter() {
                assert_eq!(connection.close_count(), 1);
            }
            // The renderer only returns once the channel is closed.
            let finished = renderer.finished.load(Ordering::SeqCst);
            assert_eq!(finished, usize::from(!renderer_fails));
        }
    }
}
