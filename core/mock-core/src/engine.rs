//! The record/replay engine.
//!
//! One long-lived [`Engine`] owns all mutable state (replay cursor, record
//! log, destination) and is driven by the server loop, one request at a
//! time. It never returns an error for a request: failures are logged and
//! turned into responses the client can interpret.

use crate::command::{self, KillSource};
use crate::config::{Mode, RcConfig, GENERAL_SECTION};
use crate::error::{MockError, Result};
use crate::fingerprint::{Fingerprint, Normalizer};
use crate::functions::FunctionRegistry;
use crate::patterns::RE_ALTERATION;
use crate::record::RecordLog;
use crate::replay::ReplayState;
use crate::script::{ReplayItems, RequestBlock};
use crate::traffic::{command_responses, CommandLine, Request, Response, ResponseKind};
use crate::transport::{RetryPolicy, Transport};
use capturemock_protocol::{CommandReply, RAISE_PREFIX};
use regex::{NoExpand, Regex};
use std::collections::HashSet;
use std::str::FromStr;

/// A `pattern{REPLACE replacement}` rewrite applied to forwarded responses.
///
/// The replacement is literal text: `$` is not a capture reference.
#[derive(Debug, Clone)]
pub struct Alteration {
    pattern: Regex,
    replacement: String,
}

impl FromStr for Alteration {
    type Err = MockError;

    fn from_str(text: &str) -> Result<Self> {
        let invalid = |details: String| MockError::ConfigInvalidOption {
            section: GENERAL_SECTION.to_string(),
            option: "alterations".to_string(),
            details,
        };
        let caps = RE_ALTERATION
            .captures(text)
            .ok_or_else(|| invalid(format!("{:?} lacks a {{REPLACE ...}} part", text)))?;
        let pattern = Regex::new(&caps[1]).map_err(|err| invalid(err.to_string()))?;
        Ok(Self {
            pattern,
            replacement: caps[2].to_string(),
        })
    }
}

impl Alteration {
    pub fn from_config(config: &RcConfig) -> Result<Vec<Self>> {
        config
            .get_list("alterations", &[GENERAL_SECTION])
            .iter()
            .map(|text| text.parse())
            .collect()
    }

    pub fn apply(&self, text: &str) -> String {
        self.pattern
            .replace_all(text, NoExpand(&self.replacement))
            .into_owned()
    }
}

pub struct Engine {
    mode: Mode,
    config: RcConfig,
    replay: ReplayState,
    record: RecordLog,
    functions: FunctionRegistry,
    destination: Option<String>,
    alterations: Vec<Alteration>,
    replay_items: Option<ReplayItems>,
    recorded_enquiries: HashSet<Fingerprint>,
}

impl Engine {
    pub fn new(
        config: RcConfig,
        mode: Mode,
        replay_blocks: Vec<RequestBlock>,
        record: RecordLog,
    ) -> Result<Self> {
        let alterations = Alteration::from_config(&config)?;
        let replay = ReplayState::new(replay_blocks, Normalizer::new(&config));
        tracing::info!(
            mode = ?mode,
            replay_blocks = replay.len(),
            recording = record.is_enabled(),
            alterations = alterations.len(),
            "Engine ready"
        );
        Ok(Self {
            mode,
            config,
            replay,
            record,
            functions: FunctionRegistry::new(),
            destination: None,
            alterations,
            replay_items: None,
            recorded_enquiries: HashSet::new(),
        })
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_destination(mut self, destination: Option<String>) -> Self {
        self.destination = destination;
        self
    }

    /// Restricts replay to the given items; everything else is recorded.
    pub fn with_replay_items(mut self, items: ReplayItems) -> Self {
        if !items.is_empty() {
            tracing::info!(items = ?items.items(), "Replaying selected items only");
            self.replay_items = Some(items);
        }
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn config(&self) -> &RcConfig {
        &self.config
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn replay_state(&self) -> &ReplayState {
        &self.replay
    }

    pub fn recorded(&self) -> usize {
        self.record.recorded()
    }

    /// Handles request number `number` and returns the responses to send, in
    /// order. `kills` is polled while a real command runs.
    pub fn process(
        &mut self,
        request: &Request,
        number: u64,
        kills: &mut dyn KillSource,
    ) -> Vec<Response> {
        if let Request::CommandKill(kill) = request {
            tracing::debug!(
                signal = kill.signal,
                pid = kill.pid,
                "Kill arrived with no command running; acknowledging"
            );
            return Vec::new();
        }

        if let Request::ServerState(state) = request {
            self.learn_destination(state);
        }

        let mode = self.effective_mode(request);
        tracing::debug!(number, mode = ?mode, request = %request, "Processing request");

        let fingerprint = Normalizer::new(&self.config).request(request);
        let enquiry_only = request.enquiry_only(&self.config);
        if mode.replays() {
            if !request.has_info() {
                return Vec::new();
            }
            if let Some(responses) = self.replay.take(&fingerprint, enquiry_only) {
                return request.filter_replay(responses);
            }
            if mode == Mode::ReplayOnly {
                tracing::warn!(fingerprint = %fingerprint, "No replay available");
                return no_replay(request, &fingerprint);
            }
        }

        let responses: Vec<Response> = self
            .forward(request, kills)
            .into_iter()
            .map(|response| self.alter(response))
            .collect();

        if mode.records() && self.should_record(fingerprint, enquiry_only) {
            if let Err(err) = self.record.record(number, request, &responses) {
                tracing::error!(error = %err, number, "Failed to record traffic");
            }
        }
        responses
    }

    /// Enquiry-only traffic is recorded once per fingerprint.
    fn should_record(&mut self, fingerprint: Fingerprint, enquiry_only: bool) -> bool {
        if !enquiry_only {
            return true;
        }
        let first = self.recorded_enquiries.insert(fingerprint);
        if !first {
            tracing::debug!("Enquiry already recorded; not recording again");
        }
        first
    }

    fn effective_mode(&self, request: &Request) -> Mode {
        if let Some(items) = &self.replay_items {
            if let Some(name) = request.item_name() {
                if !items.contains(name) {
                    return Mode::RecordOnly;
                }
            }
        }

        let sections = request.rc_sections();
        if sections.is_empty() {
            return self.mode;
        }
        let sections: Vec<&str> = sections.iter().map(String::as_str).collect();
        match self.config.get_mode(&sections) {
            Ok(Some(mode)) => mode,
            Ok(None) => self.mode,
            Err(err) => {
                tracing::warn!(error = %err, "Ignoring invalid per-intercept mode");
                self.mode
            }
        }
    }

    fn forward(&mut self, request: &Request, kills: &mut dyn KillSource) -> Vec<Response> {
        match request {
            Request::CommandLine(command) => command_responses(&run_command(command, kills)),
            Request::FunctionCall(call) => vec![Response::new(
                ResponseKind::Return,
                self.functions
                    .call(&call.envelope.function, &call.envelope.args),
            )],
            Request::ServerState(_) => Vec::new(),
            Request::ClientSocket(text) => self.relay_to_destination(text),
            Request::CommandKill(_) => Vec::new(),
        }
    }

    /// The first server state naming `host:port` as its last word sets the
    /// destination for raw socket traffic.
    fn learn_destination(&mut self, state: &str) {
        if self.destination.is_some() {
            return;
        }
        let Some(last_word) = state.split_whitespace().last() else {
            return;
        };
        let valid = last_word
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if valid {
            tracing::info!(destination = last_word, "Server state set socket destination");
            self.destination = Some(last_word.to_string());
        }
    }

    fn relay_to_destination(&self, text: &str) -> Vec<Response> {
        let Some(destination) = &self.destination else {
            tracing::debug!("No destination for client socket traffic; dropping");
            return Vec::new();
        };
        match Transport::new(destination.clone())
            .with_policy(RetryPolicy::once())
            .request(text)
        {
            Ok(reply) => vec![Response::new(ResponseKind::Server, reply)],
            Err(err) => {
                tracing::warn!(error = %err, destination, "Destination server did not answer");
                Vec::new()
            }
        }
    }

    fn alter(&self, mut response: Response) -> Response {
        for alteration in &self.alterations {
            response.text = alteration.apply(&response.text);
        }
        response
    }
}

fn run_command(command: &CommandLine, kills: &mut dyn KillSource) -> CommandReply {
    match command::run(&command.envelope, &command.name, kills) {
        Ok(reply) => reply,
        Err(MockError::CommandSpawn { command: name, source }) => {
            tracing::warn!(command = %name, error = %source, "Real command could not be started");
            CommandReply::failure(format!(
                "ERROR: Mock server could not find command '{}' in PATH",
                name
            ))
        }
        Err(err) => {
            tracing::error!(error = %err, "Real command failed");
            CommandReply::failure(format!("ERROR: {}", err))
        }
    }
}

fn no_replay(request: &Request, fingerprint: &Fingerprint) -> Vec<Response> {
    let message = format!("no replay for {}", fingerprint);
    match request {
        Request::CommandLine(_) => command_responses(&CommandReply::failure(message)),
        Request::FunctionCall(_) => vec![Response::new(
            ResponseKind::Return,
            format!("{}NoReplay({:?})", RAISE_PREFIX, message),
        )],
        Request::ClientSocket(_) => vec![Response::new(ResponseKind::Server, message)],
        Request::ServerState(_) | Request::CommandKill(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::NoKills;
    use crate::script;
    use crate::traffic::FunctionCall;
    use capturemock_protocol::{CommandKillEnvelope, Envelope, FunctionCallEnvelope};
    use std::path::Path;

    fn engine(mode: Mode, script_text: &str, rc: &str) -> Engine {
        let config = RcConfig::parse(rc, Path::new("rc")).unwrap();
        let blocks = script::parse(script_text, Path::new("script")).unwrap();
        Engine::new(config, mode, blocks, RecordLog::disabled()).unwrap()
    }

    fn recording_engine(mode: Mode, script_text: &str, rc: &str, record: &Path) -> Engine {
        let config = RcConfig::parse(rc, Path::new("rc")).unwrap();
        let blocks = script::parse(script_text, Path::new("script")).unwrap();
        Engine::new(config, mode, blocks, RecordLog::create(record, false).unwrap()).unwrap()
    }

    fn request(engine: &Engine, text: &str) -> Request {
        Request::from_envelope(Envelope::parse(text).unwrap(), engine.config()).unwrap()
    }

    fn call(function: &str) -> Request {
        Request::FunctionCall(FunctionCall::new(FunctionCallEnvelope {
            function: function.to_string(),
            args: "[]".to_string(),
        }))
    }

    fn reply(responses: &[Response]) -> String {
        responses.iter().map(Response::wire_form).collect()
    }

    const ECHO: &str = "SUT_COMMAND_LINE:['echo','hi']:SUT_SEP:{}:SUT_SEP:/tmp:SUT_SEP:1234";
    const ECHO_BYE: &str = "SUT_COMMAND_LINE:['echo','bye']:SUT_SEP:{}:SUT_SEP:/tmp:SUT_SEP:1234";

    #[test]
    fn replays_scripted_command_without_running_it() {
        let mut engine = engine(
            Mode::ReplayOnly,
            "<-CMD:['echo','hi']\n->OUT:hi\n\n->EXC:0\n",
            "",
        );
        let echo = request(&engine, ECHO);
        let responses = engine.process(&echo, 1, &mut NoKills);
        assert_eq!(reply(&responses), "hi\n|TT_CMD_SEP||TT_CMD_SEP|0");
        assert_eq!(engine.replay_state().cursor(), 1);
    }

    #[test]
    fn replay_only_mismatch_reports_no_replay() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record.txt");
        let mut engine = recording_engine(
            Mode::ReplayOnly,
            "<-CMD:['echo','hi']\n->OUT:hi\n\n->EXC:0\n",
            "",
            &record,
        );
        let bye = request(&engine, ECHO_BYE);
        let parsed = CommandReply::parse(&reply(&engine.process(&bye, 1, &mut NoKills))).unwrap();
        assert_eq!(parsed.stdout, "");
        assert!(parsed.stderr.contains("no replay for CMD:['echo','bye']"));
        assert_eq!(parsed.exit_code, 1);
        assert_eq!(engine.recorded(), 0);
        assert_eq!(std::fs::read_to_string(&record).unwrap(), "");
    }

    #[test]
    fn enquiries_are_recorded_once_per_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record.txt");
        let mut registry = FunctionRegistry::new();
        registry.register("disk.free", |_| Ok(serde_json::json!(10)));
        registry.register("disk.label", |_| Ok(serde_json::json!("")));
        let rc = "[disk]\nenquiry_only = true\n";
        let mut engine =
            recording_engine(Mode::RecordOnly, "", rc, &record).with_functions(registry);

        assert_eq!(reply(&engine.process(&call("disk.free"), 1, &mut NoKills)), "10");
        assert_eq!(reply(&engine.process(&call("disk.free"), 2, &mut NoKills)), "10");
        assert_eq!(reply(&engine.process(&call("disk.label"), 3, &mut NoKills)), "\"\"");
        engine.process(&call("disk.label"), 4, &mut NoKills);

        assert_eq!(engine.recorded(), 2);
        assert_eq!(
            std::fs::read_to_string(&record).unwrap(),
            "<-FNC:disk.free()\n->RET:10\n<-FNC:disk.label()\n->RET:\"\"\n"
        );
    }

    #[test]
    fn replayed_command_gets_default_exit_code() {
        let mut engine = engine(Mode::ReplayOnly, "<-CMD:['echo','hi']\n->OUT:hi\n", "");
        let echo = request(&engine, ECHO);
        assert_eq!(
            reply(&engine.process(&echo, 1, &mut NoKills)),
            "hi|TT_CMD_SEP||TT_CMD_SEP|0"
        );
    }

    #[test]
    fn kills_are_acknowledged_with_nothing() {
        let mut engine = engine(Mode::RecordOnly, "", "");
        let kill = Request::CommandKill(CommandKillEnvelope {
            signal: 15,
            pid: 1234,
        });
        assert!(engine.process(&kill, 1, &mut NoKills).is_empty());
    }

    #[test]
    fn function_calls_use_registry_or_raise() {
        let mut registry = FunctionRegistry::new();
        registry.register("clock.now", |_| Ok(serde_json::json!(42)));
        let mut engine = engine(Mode::RecordOnly, "", "").with_functions(registry);

        assert_eq!(reply(&engine.process(&call("clock.now"), 1, &mut NoKills)), "42");
        assert_eq!(
            reply(&engine.process(&call("clock.later"), 2, &mut NoKills)),
            "raise NotRegistered(\"clock.later\")"
        );
    }

    #[test]
    fn function_mismatch_in_replay_raises_no_replay() {
        let mut engine = engine(Mode::ReplayOnly, "<-FNC:clock.now()\n->RET:1\n", "");
        let now = call("clock.now");
        let later = call("clock.later");
        assert_eq!(reply(&engine.process(&now, 1, &mut NoKills)), "1");
        assert!(reply(&engine.process(&later, 2, &mut NoKills)).starts_with("raise NoReplay("));
    }

    #[test]
    fn per_intercept_mode_overrides_global_mode() {
        let mut registry = FunctionRegistry::new();
        registry.register("clock.now", |_| Ok(serde_json::json!("real")));
        let mut engine =
            engine(Mode::ReplayOnly, "", "[clock.now]\nmode = record\n").with_functions(registry);
        let now = call("clock.now");
        assert_eq!(reply(&engine.process(&now, 1, &mut NoKills)), "\"real\"");
    }

    #[test]
    fn items_outside_replay_filter_are_forwarded() {
        let mut registry = FunctionRegistry::new();
        registry.register("clock.now", |_| Ok(serde_json::json!("real")));
        let mut engine = engine(Mode::ReplayOnly, "<-FNC:clock.now()\n->RET:\"scripted\"\n", "")
            .with_functions(registry)
            .with_replay_items(ReplayItems::new(vec!["disk".to_string()]));
        let now = call("clock.now");
        assert_eq!(reply(&engine.process(&now, 1, &mut NoKills)), "\"real\"");
    }

    #[test]
    fn server_state_sets_destination_once() {
        let mut engine = engine(Mode::RecordOnly, "", "");
        let state = request(&engine, "SUT_SERVER:listening on localhost:4567\n");
        assert!(engine.process(&state, 1, &mut NoKills).is_empty());
        assert_eq!(engine.destination(), Some("localhost:4567"));

        let other = request(&engine, "SUT_SERVER:moved to otherhost:1\n");
        engine.process(&other, 2, &mut NoKills);
        assert_eq!(engine.destination(), Some("localhost:4567"));
    }

    #[test]
    fn replayed_server_state_still_sets_destination() {
        let mut engine = engine(
            Mode::ReplayOldRecordNew,
            "<-SRV:listening on localhost:4567\n",
            "",
        );
        let state = request(&engine, "SUT_SERVER:listening on localhost:4567\n");
        assert!(engine.process(&state, 1, &mut NoKills).is_empty());
        assert_eq!(engine.replay_state().cursor(), 1);
        assert_eq!(engine.destination(), Some("localhost:4567"));
    }

    #[test]
    fn socket_traffic_without_destination_gets_empty_reply() {
        let mut engine = engine(Mode::RecordOnly, "", "");
        let raw = request(&engine, "GET /status\n");
        assert!(engine.process(&raw, 1, &mut NoKills).is_empty());
    }

    #[test]
    fn alterations_rewrite_forwarded_text() {
        let rc = "[general]\nalterations = \\d+ms{REPLACE <time>}\n";
        let mut registry = FunctionRegistry::new();
        registry.register("timer.elapsed", |_| Ok(serde_json::json!("took 153ms")));
        let mut engine = engine(Mode::RecordOnly, "", rc).with_functions(registry);
        let call = call("timer.elapsed");
        assert_eq!(
            reply(&engine.process(&call, 1, &mut NoKills)),
            "\"took <time>\""
        );
    }

    #[test]
    fn alteration_replacement_is_literal() {
        let alteration: Alteration = "cost \\d+{REPLACE $1 price}".parse().unwrap();
        assert_eq!(alteration.apply("cost 12 total"), "$1 price total");
    }

    #[test]
    fn invalid_alteration_is_a_configuration_error() {
        let config =
            RcConfig::parse("[general]\nalterations = no replacement\n", Path::new("rc")).unwrap();
        assert!(Engine::new(config, Mode::RecordOnly, Vec::new(), RecordLog::disabled()).is_err());
    }
}
