//! PIN verification and modification flows
//!
//! One attempt walks Idle -> AwaitingInput -> {Confirmed, Cancelled,
//! TimedOut}. The collection collaborator runs on a dedicated interaction
//! thread and hands its result back over a channel; the engine thread blocks
//! on a receive-with-deadline, so the three-way outcome falls out of the
//! channel discipline directly. When the reader has a usable PIN pad the
//! AwaitingInput state is skipped entirely: the pad collects the digits and
//! the returned status word is interpreted in place.
//!
//! Once an attempt ends in Cancelled or TimedOut, no further card I/O is
//! issued for it.

use std::sync::Arc;
use std::thread;

use citizencard_apdu_core::{status, CardTransport, Response, StatusWord};
use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::driver::{ExclusiveChannel, ProtocolDriver};
use crate::error::{Error, Result};
use crate::pinpad::features::{self, FeatureSet};
use crate::pinpad::frame::FrameEncoder;
use crate::types::{FlowSession, PinDescriptor, PinFlowResult, SecretPin};

/// Pad-level status word: entry timed out on the reader
const SW_PAD_TIMEOUT: StatusWord = StatusWord::new(0x64, 0x00);
/// Pad-level status word: entry cancelled on the reader
const SW_PAD_CANCELLED: StatusWord = StatusWord::new(0x64, 0x01);

/// Result of one PIN collection
#[derive(Debug)]
pub enum Collected {
    /// The user confirmed this PIN
    Pin(SecretPin),
    /// The user declined
    Cancelled,
}

/// Result of one PIN-change collection
#[derive(Debug)]
pub enum CollectedChange {
    /// The user confirmed both PINs
    Pins {
        /// Current PIN
        old: SecretPin,
        /// Replacement PIN
        new: SecretPin,
    },
    /// The user declined
    Cancelled,
}

/// The PIN-collection collaborator
///
/// Implementations block until the user acts and must release the engine
/// exactly once per call; they are invoked on a dedicated interaction
/// thread, never on the engine's calling thread.
pub trait PinCollector: Send + Sync {
    /// Collect one PIN
    fn collect_pin(&self, descriptor: &PinDescriptor, session: &FlowSession) -> Collected;

    /// Collect a replacement PIN (with confirmation), the current PIN having
    /// been verified in a separate preceding step
    fn collect_new_pin(&self, descriptor: &PinDescriptor, session: &FlowSession) -> Collected {
        self.collect_pin(descriptor, session)
    }

    /// Collect current and replacement PIN in one dialog
    fn collect_pin_change(
        &self,
        descriptor: &PinDescriptor,
        session: &FlowSession,
    ) -> CollectedChange;
}

/// What came out of the interaction gate
enum Gate<T> {
    Delivered(T),
    TimedOut,
    Closed,
}

enum CollectOutcome {
    Entered(SecretPin),
    Cancelled,
    TimedOut,
}

/// Drives PIN verification and modification against a bound card
pub struct PinFlowController {
    config: EngineConfig,
    collector: Arc<dyn PinCollector>,
}

impl std::fmt::Debug for PinFlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinFlowController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PinFlowController {
    /// Create a controller with the given configuration and collaborator
    pub fn new(config: EngineConfig, collector: Arc<dyn PinCollector>) -> Self {
        Self { config, collector }
    }

    /// Verify a PIN
    ///
    /// An external PIN is passed straight to the card when policy permits
    /// (or an OTP-driven PIN change is in progress) - interactive collection
    /// is skipped entirely. Otherwise the PIN pad takes over when the
    /// reader, the driver pairing and policy all allow it; the software
    /// dialog is the fallback.
    pub fn verify_pin(
        &self,
        transport: &mut dyn CardTransport,
        driver: &dyn ProtocolDriver,
        descriptor: &PinDescriptor,
        external_pin: Option<SecretPin>,
        session: &FlowSession,
    ) -> Result<PinFlowResult> {
        let reader = transport.reader_name().to_string();
        let features = FeatureSet::probe(transport);
        let pad_usable = features.has_verify_pin_pad()
            && features::pad_allowed(&self.config, &reader)
            && features::supports_verify_via_pin_pad(&self.config, &reader, driver.kind());

        if let Some(pin) = external_pin {
            let pass_through =
                self.config.allow_external_pin_caching || session.pin_change_in_progress;
            if pass_through && (!pad_usable || features::can_inject_pin_via_os(&self.config, &reader))
            {
                return self.verify_on_card(transport, driver, descriptor, &pin);
            }
        }

        if pad_usable {
            return self.verify_on_pad(transport, driver, descriptor, &features, &reader);
        }

        match self.collect(descriptor, session) {
            CollectOutcome::Entered(pin) => self.verify_on_card(transport, driver, descriptor, &pin),
            CollectOutcome::Cancelled => Ok(PinFlowResult::Cancelled),
            CollectOutcome::TimedOut => Ok(PinFlowResult::TimedOut),
        }
    }

    /// Change a PIN
    ///
    /// Composes two verification-style collections (current PIN, then
    /// replacement with confirmation) when the driver verifies before
    /// modifying, or a single combined collection otherwise, then dispatches
    /// through the same pad-vs-dialog branch as verification. The whole
    /// sequence, application selection included, holds the channel
    /// exclusively.
    pub fn modify_pin(
        &self,
        transport: &mut dyn CardTransport,
        driver: &dyn ProtocolDriver,
        descriptor: &PinDescriptor,
        session: &FlowSession,
    ) -> Result<PinFlowResult> {
        let mut guard = ExclusiveChannel::acquire(transport)?;
        driver.select_application(guard.transport())?;
        let reader = guard.transport().reader_name().to_string();
        let features = FeatureSet::probe(guard.transport());
        let pad_usable = features.has_modify_pin_pad()
            && features::pad_allowed(&self.config, &reader)
            && features::supports_verify_via_pin_pad(&self.config, &reader, driver.kind());

        if driver.verify_to_modify() {
            let verified = self.verify_pin(guard.transport(), driver, descriptor, None, session)?;
            if verified != PinFlowResult::Success {
                return Ok(verified);
            }

            if pad_usable {
                return self.modify_on_pad(guard.transport(), driver, descriptor, &features, &reader, true);
            }

            match self.collect_new(descriptor, session) {
                CollectOutcome::Entered(new_pin) => {
                    let cmd = driver.fill_modify_pin_apdu(descriptor, None, &new_pin)?;
                    let response = guard.transport().transmit(&cmd)?;
                    interpret_status(response.status())
                }
                CollectOutcome::Cancelled => Ok(PinFlowResult::Cancelled),
                CollectOutcome::TimedOut => Ok(PinFlowResult::TimedOut),
            }
        } else {
            if pad_usable {
                return self.modify_on_pad(guard.transport(), driver, descriptor, &features, &reader, false);
            }

            match self.collect_change(descriptor, session) {
                Some((old_pin, new_pin)) => {
                    let cmd = driver.fill_modify_pin_apdu(descriptor, Some(&old_pin), &new_pin)?;
                    let response = guard.transport().transmit(&cmd)?;
                    interpret_status(response.status())
                }
                None => Ok(PinFlowResult::Cancelled),
            }
        }
    }

    /// Send the VERIFY command with the PIN block filled in
    fn verify_on_card(
        &self,
        transport: &mut dyn CardTransport,
        driver: &dyn ProtocolDriver,
        descriptor: &PinDescriptor,
        pin: &SecretPin,
    ) -> Result<PinFlowResult> {
        let cmd = driver.verify_apdu(descriptor, Some(pin))?;
        let response = transport.transmit(&cmd)?;
        interpret_status(response.status())
    }

    /// Delegate PIN entry to the reader's pad
    fn verify_on_pad(
        &self,
        transport: &mut dyn CardTransport,
        driver: &dyn ProtocolDriver,
        descriptor: &PinDescriptor,
        features: &FeatureSet,
        reader: &str,
    ) -> Result<PinFlowResult> {
        let code = features
            .verify_control_code()
            .ok_or(Error::InvalidData("pad verify without control code"))?;
        let template = driver.verify_apdu(descriptor, None)?;
        let frame = self.encoder_for(reader).encode_verify(
            self.pad_timeout(),
            descriptor.min_length,
            descriptor.max_length,
            &template,
        );
        debug!(reader, "delegating PIN verification to pad");
        let raw = transport.send_control(code, &frame)?;
        let response = Response::from_bytes(&raw)?;
        interpret_pad_status(response.status())
    }

    /// Delegate a PIN change to the reader's pad
    fn modify_on_pad(
        &self,
        transport: &mut dyn CardTransport,
        driver: &dyn ProtocolDriver,
        descriptor: &PinDescriptor,
        features: &FeatureSet,
        reader: &str,
        verify_precedes_modify: bool,
    ) -> Result<PinFlowResult> {
        let code = features
            .modify_control_code()
            .ok_or(Error::InvalidData("pad modify without control code"))?;
        let template = driver.modify_pin_apdu(descriptor);
        let frame = self.encoder_for(reader).encode_modify(
            verify_precedes_modify,
            self.pad_timeout(),
            descriptor.min_length,
            descriptor.max_length,
            &template,
        );
        debug!(reader, "delegating PIN change to pad");
        let raw = transport.send_control(code, &frame)?;
        let response = Response::from_bytes(&raw)?;
        interpret_pad_status(response.status())
    }

    fn encoder_for(&self, reader: &str) -> FrameEncoder {
        let profile = self
            .config
            .reader_policy(reader)
            .map(|p| p.pad_profile)
            .unwrap_or_default();
        FrameEncoder::new(profile)
    }

    fn pad_timeout(&self) -> u8 {
        if self.config.timed_interaction {
            self.config.pin_timeout.as_secs().min(0xFF) as u8
        } else {
            // 0 leaves the reader's own default in effect
            0
        }
    }

    fn collect(&self, descriptor: &PinDescriptor, session: &FlowSession) -> CollectOutcome {
        let descriptor = descriptor.clone();
        let session = session.clone();
        let gate =
            self.run_on_interaction_thread(move |c| c.collect_pin(&descriptor, &session));
        Self::gate_to_outcome(gate)
    }

    fn collect_new(&self, descriptor: &PinDescriptor, session: &FlowSession) -> CollectOutcome {
        let descriptor = descriptor.clone();
        let session = session.clone();
        let gate =
            self.run_on_interaction_thread(move |c| c.collect_new_pin(&descriptor, &session));
        Self::gate_to_outcome(gate)
    }

    fn collect_change(
        &self,
        descriptor: &PinDescriptor,
        session: &FlowSession,
    ) -> Option<(SecretPin, SecretPin)> {
        let descriptor = descriptor.clone();
        let session = session.clone();
        match self.run_on_interaction_thread(move |c| c.collect_pin_change(&descriptor, &session))
        {
            Gate::Delivered(CollectedChange::Pins { old, new }) => Some((old, new)),
            Gate::Delivered(CollectedChange::Cancelled) | Gate::Closed | Gate::TimedOut => None,
        }
    }

    fn gate_to_outcome(gate: Gate<Collected>) -> CollectOutcome {
        match gate {
            Gate::Delivered(Collected::Pin(pin)) => CollectOutcome::Entered(pin),
            // A collection window closed by other means counts as cancelled
            Gate::Delivered(Collected::Cancelled) | Gate::Closed => CollectOutcome::Cancelled,
            Gate::TimedOut => CollectOutcome::TimedOut,
        }
    }

    /// Run the collaborator on the interaction thread and wait on the gate
    ///
    /// A single deadline bounds the whole attempt; when the timer is
    /// disabled globally the wait is unbounded.
    fn run_on_interaction_thread<T, F>(&self, f: F) -> Gate<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn PinCollector>) -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let collector = Arc::clone(&self.collector);
        let spawned = thread::Builder::new()
            .name("pin-entry".into())
            .spawn(move || {
                let _ = tx.send(f(collector));
            });
        if spawned.is_err() {
            warn!("could not start the PIN interaction thread");
            return Gate::Closed;
        }

        if self.config.timed_interaction {
            match rx.recv_timeout(self.config.pin_timeout) {
                Ok(value) => Gate::Delivered(value),
                Err(RecvTimeoutError::Timeout) => Gate::TimedOut,
                Err(RecvTimeoutError::Disconnected) => Gate::Closed,
            }
        } else {
            match rx.recv() {
                Ok(value) => Gate::Delivered(value),
                Err(_) => Gate::Closed,
            }
        }
    }
}

/// Map a verification status word into the PIN taxonomy
///
/// Anything outside the recognized family is a protocol-level error, not a
/// PIN outcome.
fn interpret_status(sw: StatusWord) -> Result<PinFlowResult> {
    if sw.is_success() {
        return Ok(PinFlowResult::Success);
    }
    if let Some(tries) = status::retry_counter(sw) {
        return Ok(if tries == 0 {
            PinFlowResult::Blocked
        } else {
            PinFlowResult::WrongPin(tries)
        });
    }
    if sw == status::SW_AUTH_METHOD_BLOCKED {
        return Ok(PinFlowResult::Blocked);
    }
    Err(Error::UnexpectedStatus(sw))
}

/// Pad responses add reader-level timeout/cancel words to the taxonomy
fn interpret_pad_status(sw: StatusWord) -> Result<PinFlowResult> {
    if sw == SW_PAD_TIMEOUT {
        return Ok(PinFlowResult::TimedOut);
    }
    if sw == SW_PAD_CANCELLED {
        return Ok(PinFlowResult::Cancelled);
    }
    interpret_status(sw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::starcos::StarcosDriver;
    use crate::types::PinKind;
    use citizencard_apdu_core::MockTransport;
    use std::time::Duration;

    struct StaticCollector(&'static str);

    impl PinCollector for StaticCollector {
        fn collect_pin(&self, _: &PinDescriptor, _: &FlowSession) -> Collected {
            Collected::Pin(SecretPin::from(self.0))
        }

        fn collect_pin_change(&self, _: &PinDescriptor, _: &FlowSession) -> CollectedChange {
            CollectedChange::Pins {
                old: SecretPin::from(self.0),
                new: SecretPin::from("111111"),
            }
        }
    }

    struct CancellingCollector;

    impl PinCollector for CancellingCollector {
        fn collect_pin(&self, _: &PinDescriptor, _: &FlowSession) -> Collected {
            Collected::Cancelled
        }

        fn collect_pin_change(&self, _: &PinDescriptor, _: &FlowSession) -> CollectedChange {
            CollectedChange::Cancelled
        }
    }

    struct SlowCollector;

    impl PinCollector for SlowCollector {
        fn collect_pin(&self, _: &PinDescriptor, _: &FlowSession) -> Collected {
            thread::sleep(Duration::from_secs(2));
            Collected::Cancelled
        }

        fn collect_pin_change(&self, _: &PinDescriptor, _: &FlowSession) -> CollectedChange {
            thread::sleep(Duration::from_secs(2));
            CollectedChange::Cancelled
        }
    }

    struct UnreachableCollector;

    impl PinCollector for UnreachableCollector {
        fn collect_pin(&self, _: &PinDescriptor, _: &FlowSession) -> Collected {
            panic!("dialog must not open");
        }

        fn collect_pin_change(&self, _: &PinDescriptor, _: &FlowSession) -> CollectedChange {
            panic!("dialog must not open");
        }
    }

    fn controller(collector: impl PinCollector + 'static) -> PinFlowController {
        PinFlowController::new(EngineConfig::new(), Arc::new(collector))
    }

    #[test]
    fn status_word_taxonomy() {
        assert_eq!(
            interpret_status(StatusWord::new(0x90, 0x00)).unwrap(),
            PinFlowResult::Success
        );
        assert_eq!(
            interpret_status(StatusWord::new(0x63, 0xC2)).unwrap(),
            PinFlowResult::WrongPin(2)
        );
        // Zero tries remaining is Blocked, not WrongPin(0)
        assert_eq!(
            interpret_status(StatusWord::new(0x63, 0xC0)).unwrap(),
            PinFlowResult::Blocked
        );
        assert_eq!(
            interpret_status(StatusWord::new(0x69, 0x83)).unwrap(),
            PinFlowResult::Blocked
        );
        assert!(matches!(
            interpret_status(StatusWord::new(0x6A, 0x80)),
            Err(Error::UnexpectedStatus(_))
        ));
    }

    #[test]
    fn dialog_verification_round_trip() {
        let driver = StarcosDriver::new();
        let descriptor = driver.pin(PinKind::Signature).unwrap().clone();
        let mut transport = MockTransport::new("Plain Reader", vec![]);
        transport.push_response(&[0x90, 0x00][..]);

        let flow = controller(StaticCollector("123456"));
        let result = flow
            .verify_pin(&mut transport, &driver, &descriptor, None, &FlowSession::default())
            .unwrap();
        assert_eq!(result, PinFlowResult::Success);

        // One VERIFY APDU went out, with the collected digits in the block
        assert_eq!(transport.commands.len(), 1);
        let verify = &transport.commands[0];
        assert_eq!(&verify[..4], &[0x00, 0x20, 0x00, 0x81]);
        assert_eq!(&verify[5..11], b"123456");
    }

    #[test]
    fn cancellation_stops_before_card_io() {
        let driver = StarcosDriver::new();
        let descriptor = driver.pin(PinKind::Authentication).unwrap().clone();
        let mut transport = MockTransport::new("Plain Reader", vec![]);

        let flow = controller(CancellingCollector);
        let result = flow
            .verify_pin(&mut transport, &driver, &descriptor, None, &FlowSession::default())
            .unwrap();
        assert_eq!(result, PinFlowResult::Cancelled);
        assert!(transport.commands.is_empty());
    }

    #[test]
    fn timeout_is_distinct_from_cancellation() {
        let driver = StarcosDriver::new();
        let descriptor = driver.pin(PinKind::Authentication).unwrap().clone();
        let mut transport = MockTransport::new("Plain Reader", vec![]);

        let config = EngineConfig::new().with_pin_timeout(Duration::from_millis(50));
        let flow = PinFlowController::new(config, Arc::new(SlowCollector));
        let result = flow
            .verify_pin(&mut transport, &driver, &descriptor, None, &FlowSession::default())
            .unwrap();
        assert_eq!(result, PinFlowResult::TimedOut);
        assert!(transport.commands.is_empty());
    }

    #[test]
    fn external_pin_skips_collection_when_permitted() {
        let driver = StarcosDriver::new();
        let descriptor = driver.pin(PinKind::Signature).unwrap().clone();
        let mut transport = MockTransport::new("Plain Reader", vec![]);
        transport.push_response(&[0x63, 0xC2][..]);

        let config = EngineConfig::new().with_external_pin_caching(true);
        let flow = PinFlowController::new(config, Arc::new(UnreachableCollector));
        let result = flow
            .verify_pin(
                &mut transport,
                &driver,
                &descriptor,
                Some(SecretPin::from("123456")),
                &FlowSession::default(),
            )
            .unwrap();
        assert_eq!(result, PinFlowResult::WrongPin(2));
    }

    #[test]
    fn external_pin_forced_interactive_when_policy_forbids() {
        let driver = StarcosDriver::new();
        let descriptor = driver.pin(PinKind::Signature).unwrap().clone();
        let mut transport = MockTransport::new("Plain Reader", vec![]);
        transport.push_response(&[0x90, 0x00][..]);

        // Pass-through disallowed: the dialog runs despite the external PIN
        let flow = controller(StaticCollector("654321"));
        let result = flow
            .verify_pin(
                &mut transport,
                &driver,
                &descriptor,
                Some(SecretPin::from("123456")),
                &FlowSession::default(),
            )
            .unwrap();
        assert_eq!(result, PinFlowResult::Success);
        assert_eq!(&transport.commands[0][5..11], b"654321");
    }

    #[test]
    fn pad_verification_skips_dialog() {
        let driver = StarcosDriver::new();
        let descriptor = driver.pin(PinKind::Signature).unwrap().clone();
        let mut transport = MockTransport::new("Pad Reader", vec![]);
        // Probe advertises verify-direct, then the pad reports success
        transport.push_control_response(&[0x06, 0x04, 0x42, 0x33, 0x00, 0x06][..]);
        transport.push_control_response(&[0x90, 0x00][..]);

        let flow = controller(UnreachableCollector);
        let result = flow
            .verify_pin(&mut transport, &driver, &descriptor, None, &FlowSession::default())
            .unwrap();
        assert_eq!(result, PinFlowResult::Success);

        // No APDU went over the card channel; the frame went to the pad
        assert!(transport.commands.is_empty());
        let (code, frame) = &transport.control_commands[1];
        assert_eq!(*code, 0x4233_0006);
        assert_eq!(frame[0], 30); // default timeout seconds
        assert_eq!(frame[5], descriptor.max_length);
        assert_eq!(frame[6], descriptor.min_length);
    }

    #[test]
    fn pad_cancel_and_timeout_words() {
        assert_eq!(
            interpret_pad_status(StatusWord::new(0x64, 0x01)).unwrap(),
            PinFlowResult::Cancelled
        );
        assert_eq!(
            interpret_pad_status(StatusWord::new(0x64, 0x00)).unwrap(),
            PinFlowResult::TimedOut
        );
        assert_eq!(
            interpret_pad_status(StatusWord::new(0x63, 0xC1)).unwrap(),
            PinFlowResult::WrongPin(1)
        );
    }

    #[test]
    fn combined_modify_collects_both_pins() {
        let driver = crate::driver::acos::AcosDriver::new();
        let descriptor = driver.pin(PinKind::Signature).unwrap().clone();
        let mut transport = MockTransport::new("Plain Reader", vec![]);
        transport.push_response(&[0x90, 0x00][..]); // SELECT application
        transport.push_response(&[0x90, 0x00][..]); // CHANGE REFERENCE DATA

        let flow = controller(StaticCollector("123456"));
        let result = flow
            .modify_pin(&mut transport, &driver, &descriptor, &FlowSession::default())
            .unwrap();
        assert_eq!(result, PinFlowResult::Success);

        // Application selection, then one combined CHANGE REFERENCE DATA
        // with old and new blocks
        assert_eq!(&transport.commands[0][..4], &[0x00, 0xA4, 0x04, 0x0C]);
        let change = &transport.commands[1];
        assert_eq!(&change[..4], &[0x00, 0x24, 0x00, 0x81]);
        assert_eq!(change[4], 16);
        // Exclusivity held for the whole sequence and released
        assert_eq!(transport.begin_exclusive_calls, 1);
        assert_eq!(transport.end_exclusive_calls, 1);
    }

    #[test]
    fn separate_verify_then_modify() {
        let driver = StarcosDriver::new();
        let descriptor = driver.pin(PinKind::Signature).unwrap().clone();
        let mut transport = MockTransport::new("Plain Reader", vec![]);
        transport.push_response(&[0x90, 0x00][..]); // SELECT application
        transport.push_response(&[0x90, 0x00][..]); // VERIFY old PIN
        transport.push_response(&[0x90, 0x00][..]); // CHANGE with new block

        let flow = controller(StaticCollector("123456"));
        let result = flow
            .modify_pin(&mut transport, &driver, &descriptor, &FlowSession::default())
            .unwrap();
        assert_eq!(result, PinFlowResult::Success);

        assert_eq!(transport.commands.len(), 3);
        assert_eq!(&transport.commands[0][..4], &[0x00, 0xA4, 0x04, 0x0C]);
        assert_eq!(transport.commands[1][1], 0x20); // VERIFY
        assert_eq!(&transport.commands[2][..4], &[0x00, 0x24, 0x01, 0x81]);
        assert_eq!(transport.commands[2][4], 8); // new block only
    }
}
