//! Card protocol drivers
//!
//! One driver per supported card operating system. The two variants share
//! the ISO 7816-4 skeleton (provided trait methods); what differs is pure
//! data: application identifiers, the digest-prefix table, the
//! padding-to-algorithm-id table, the PIN descriptors and the file set,
//! plus the shape of the PIN-change command (`verify_to_modify`).

pub mod acos;
pub mod starcos;

use std::fmt;

use citizencard_apdu_core::{status, CardTransport, Command, StatusWord};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pin_flow::PinFlowController;
use crate::registry::DriverKind;
use crate::types::{
    CardFile, DigestAlgorithm, FlowSession, PaddingScheme, PinDescriptor, PinFlowResult, PinKind,
    SecretPin,
};
use crate::util;

/// PIN block length shared by both card OS variants
pub(crate) const PIN_BLOCK_LEN: usize = 8;

/// A request to produce a digital signature over a precomputed hash
#[derive(Debug, Clone)]
pub struct SignRequest {
    /// The hash to sign
    pub hash: Vec<u8>,
    /// Which digest produced the hash
    pub digest: DigestAlgorithm,
    /// Requested padding scheme
    pub padding: PaddingScheme,
    /// Which key (addressed by its guarding PIN) signs
    pub key: PinKind,
    /// Caller-supplied PIN, forwarded subject to pass-through policy
    pub external_pin: Option<SecretPin>,
}

/// Exclusive use of the card channel for the duration of one multi-step
/// operation. Released on drop, on every exit path.
pub(crate) struct ExclusiveChannel<'a> {
    transport: &'a mut dyn CardTransport,
}

impl<'a> ExclusiveChannel<'a> {
    pub(crate) fn acquire(transport: &'a mut dyn CardTransport) -> Result<Self> {
        transport.begin_exclusive()?;
        Ok(Self { transport })
    }

    pub(crate) fn transport(&mut self) -> &mut dyn CardTransport {
        self.transport
    }
}

impl Drop for ExclusiveChannel<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.transport.end_exclusive() {
            warn!(%err, "failed to release exclusive card access");
        }
    }
}

impl fmt::Debug for ExclusiveChannel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveChannel").finish_non_exhaustive()
    }
}

/// Protocol driver for one card operating system
pub trait ProtocolDriver: Send + fmt::Debug {
    /// Which variant this is
    fn kind(&self) -> DriverKind;

    /// The application identifier selected before signature operations
    fn application_id(&self) -> &'static [u8];

    /// The PINs this card OS exposes
    fn pin_descriptors(&self) -> &[PinDescriptor];

    /// The files this card OS exposes
    fn files(&self) -> &[CardFile];

    /// Whether PIN modification is preceded by an explicit verify step
    /// (`true`: the change frame carries only the new PIN block; `false`:
    /// one combined frame carries old and new blocks)
    fn verify_to_modify(&self) -> bool;

    /// DigestInfo prefix bytes for a digest algorithm, if supported
    fn digest_prefix(&self, digest: DigestAlgorithm) -> Option<&'static [u8]>;

    /// Card algorithm identifier for a digest/padding pair, if supported
    fn signature_algorithm_id(
        &self,
        digest: DigestAlgorithm,
        padding: PaddingScheme,
    ) -> Option<u8>;

    /// The SELECT command for a file identifier (variant-specific P1/P2)
    fn select_apdu(&self, fid: &[u8]) -> Command;

    /// Look up a PIN descriptor by kind
    fn pin(&self, kind: PinKind) -> Result<&PinDescriptor> {
        self.pin_descriptors()
            .iter()
            .find(|d| d.kind == kind)
            .ok_or(Error::InvalidData("driver does not expose this PIN"))
    }

    /// Look up a file by identifier
    fn file(&self, id: &str) -> Option<&CardFile> {
        self.files().iter().find(|f| f.id == id)
    }

    /// Select the signature application
    fn select_application(&self, transport: &mut dyn CardTransport) -> Result<()> {
        let cmd = Command::new(0x00, 0xA4, 0x04, 0x0C).with_data(self.application_id().to_vec());
        let response = transport.transmit(&cmd)?;
        if !response.is_success() {
            return Err(Error::UnexpectedStatus(response.status()));
        }
        Ok(())
    }

    /// Select a file and return the size its FCI declares, if any
    fn select_file(&self, transport: &mut dyn CardTransport, file: &CardFile) -> Result<Option<usize>> {
        let fid = util::decode_file_id(file.id)?;
        let response = transport.transmit(&self.select_apdu(&fid))?;
        if !response.is_success() {
            return Err(Error::UnexpectedStatus(response.status()));
        }
        let size = response
            .payload()
            .and_then(|fci| util::fci_file_size(fci));
        debug!(file = file.id, ?size, "selected file");
        Ok(size)
    }

    /// Read bytes from the currently selected file
    ///
    /// With a known `length` the read stops exactly there; without one it
    /// runs until the card signals end of file or returns a short chunk.
    fn read_binary(
        &self,
        transport: &mut dyn CardTransport,
        offset: u32,
        length: Option<usize>,
    ) -> Result<Vec<u8>> {
        const END_OF_FILE: StatusWord = StatusWord::new(0x62, 0x82);
        const WRONG_OFFSET: StatusWord = StatusWord::new(0x6B, 0x00);

        let mut out = Vec::with_capacity(length.unwrap_or(256));
        let mut pos = offset;
        loop {
            let remaining = match length {
                Some(len) => {
                    // A misbehaving card may answer with more bytes than
                    // requested; the running total can then exceed `len`
                    let remaining = len.saturating_sub(out.len());
                    if remaining == 0 {
                        break;
                    }
                    Some(remaining)
                }
                None => None,
            };
            // Le = 0 requests up to 256 bytes
            let le = remaining.map_or(0u8, |r| if r >= 256 { 0 } else { r as u8 });
            let cmd = Command::new_with_le(0x00, 0xB0, (pos >> 8) as u8, (pos & 0xFF) as u8, le);
            let response = transport.transmit(&cmd)?;
            let sw = response.status();

            if sw.is_success() || sw == END_OF_FILE {
                let chunk = response.payload().map(|p| p.to_vec()).unwrap_or_default();
                pos += chunk.len() as u32;
                let short = chunk.len() < 256;
                out.extend_from_slice(&chunk);
                if sw == END_OF_FILE || chunk.is_empty() || (length.is_none() && short) {
                    break;
                }
            } else if sw == WRONG_OFFSET && length.is_none() && !out.is_empty() {
                break;
            } else {
                return Err(Error::UnexpectedStatus(sw));
            }
        }
        if let Some(len) = length {
            out.truncate(len);
        }
        Ok(out)
    }

    /// Select a file and read its content, honoring its read window
    fn read_file(&self, transport: &mut dyn CardTransport, file: &CardFile) -> Result<Vec<u8>> {
        let size_hint = self.select_file(transport, file)?;
        let (offset, length) = match file.window {
            Some((offset, length)) => (offset, Some(length)),
            None => (0, size_hint.or(file.max_size)),
        };
        self.read_binary(transport, offset, length)
    }

    /// Select a file and read one fragment of it
    fn read_fragment(
        &self,
        transport: &mut dyn CardTransport,
        file: &CardFile,
        offset: usize,
        length: usize,
    ) -> Result<Vec<u8>> {
        self.select_file(transport, file)?;
        self.read_binary(transport, offset as u32, Some(length))
    }

    /// Ask the card for 8 random bytes
    fn get_challenge(&self, transport: &mut dyn CardTransport) -> Result<[u8; 8]> {
        let cmd = Command::new_with_le(0x00, 0x84, 0x00, 0x00, 0x08);
        let response = transport.transmit(&cmd)?;
        if !response.is_success() {
            return Err(Error::UnexpectedStatus(response.status()));
        }
        let payload = response
            .payload()
            .ok_or(Error::InvalidData("challenge without payload"))?;
        let bytes: [u8; 8] = payload
            .as_ref()
            .try_into()
            .map_err(|_| Error::InvalidData("challenge is not 8 bytes"))?;
        Ok(bytes)
    }

    /// Produce `n` random bytes by concatenating successive challenges
    fn random_bytes(&self, transport: &mut dyn CardTransport, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n.next_multiple_of(8));
        while out.len() < n {
            out.extend_from_slice(&self.get_challenge(transport)?);
        }
        out.truncate(n);
        Ok(out)
    }

    /// Build the VERIFY command for a PIN
    ///
    /// With `pin` absent the block is all pad characters; a PIN-pad reader
    /// fills the digits in on its own per the frame's insertion offsets.
    fn verify_apdu(&self, descriptor: &PinDescriptor, pin: Option<&SecretPin>) -> Result<Command> {
        let block = pin_block(descriptor, pin)?;
        Ok(Command::new(0x00, 0x20, 0x00, descriptor.reference).with_data(block))
    }

    /// The PIN-change command template with empty PIN blocks, for the
    /// PIN-pad path
    fn modify_pin_apdu(&self, descriptor: &PinDescriptor) -> Command {
        let blocks = if self.verify_to_modify() { 1 } else { 2 };
        let data = vec![descriptor.pad_char; PIN_BLOCK_LEN * blocks];
        let p1 = if self.verify_to_modify() { 0x01 } else { 0x00 };
        Command::new(0x00, 0x24, p1, descriptor.reference).with_data(data)
    }

    /// Build the PIN-change command with the given PIN blocks filled in
    ///
    /// The `verify_to_modify` variant fills only the new block; verification
    /// of the old PIN happened as a separate preceding step. The combined
    /// variant fills old and new blocks into one frame.
    fn fill_modify_pin_apdu(
        &self,
        descriptor: &PinDescriptor,
        old_pin: Option<&SecretPin>,
        new_pin: &SecretPin,
    ) -> Result<Command> {
        if self.verify_to_modify() {
            let block = pin_block(descriptor, Some(new_pin))?;
            Ok(Command::new(0x00, 0x24, 0x01, descriptor.reference).with_data(block))
        } else {
            let old = old_pin.ok_or(Error::InvalidData("old PIN required for combined change"))?;
            let mut data = pin_block(descriptor, Some(old))?;
            data.extend_from_slice(&pin_block(descriptor, Some(new_pin))?);
            Ok(Command::new(0x00, 0x24, 0x00, descriptor.reference).with_data(data))
        }
    }

    /// Assemble the bytes handed to the compute-signature command
    fn digest_info(
        &self,
        digest: DigestAlgorithm,
        padding: PaddingScheme,
        hash: &[u8],
    ) -> Result<Vec<u8>> {
        let prefix = self
            .digest_prefix(digest)
            .ok_or(Error::UnknownDigestAlgorithm(digest))?;
        // PSS signs the bare hash; PKCS#1 v1.5 wants the ASN.1 DigestInfo
        let mut payload = match padding {
            PaddingScheme::Pss => Vec::new(),
            PaddingScheme::Pkcs1V15 => prefix.to_vec(),
        };
        payload.extend_from_slice(hash);
        Ok(payload)
    }
}

/// Pad PIN digits into a fixed-length block
pub(crate) fn pin_block(descriptor: &PinDescriptor, pin: Option<&SecretPin>) -> Result<Vec<u8>> {
    let mut block = vec![descriptor.pad_char; PIN_BLOCK_LEN];
    if let Some(pin) = pin {
        if pin.len() < descriptor.min_length as usize || pin.len() > descriptor.max_length as usize
        {
            return Err(Error::InvalidData("PIN length out of range"));
        }
        block[..pin.len()].copy_from_slice(pin.as_bytes());
    }
    Ok(block)
}

/// Produce a signature over a precomputed hash
///
/// The whole sequence - select application, verify PIN, set the security
/// environment, compute the signature - runs under exclusive channel use.
/// A wrong PIN re-prompts interactively; blocked, cancelled and timed-out
/// outcomes abort with their typed errors.
pub fn sign(
    driver: &dyn ProtocolDriver,
    transport: &mut dyn CardTransport,
    flow: &PinFlowController,
    request: &SignRequest,
    session: &FlowSession,
) -> Result<Vec<u8>> {
    let descriptor = driver.pin(request.key)?.clone();
    let payload = driver.digest_info(request.digest, request.padding, &request.hash)?;

    let mut guard = ExclusiveChannel::acquire(transport)?;
    driver.select_application(guard.transport())?;

    let mut external = request.external_pin.clone();
    loop {
        let outcome = flow.verify_pin(
            guard.transport(),
            driver,
            &descriptor,
            external.take(),
            session,
        )?;
        match outcome {
            PinFlowResult::Success => break,
            PinFlowResult::WrongPin(tries) => {
                debug!(tries, "wrong PIN, re-prompting");
            }
            PinFlowResult::Blocked => return Err(Error::PinBlocked),
            PinFlowResult::Cancelled => return Err(Error::PinEntryCancelled),
            PinFlowResult::TimedOut => return Err(Error::PinTimedOut),
        }
    }

    let algorithm = driver
        .signature_algorithm_id(request.digest, request.padding)
        .ok_or(Error::UnsupportedAlgorithm {
            digest: request.digest,
            padding: request.padding,
        })?;

    // MSE SET: pick algorithm and key for digital signature templates
    let mse = Command::new_with_data(
        0x00,
        0x22,
        0x41,
        0xB6,
        vec![0x80, 0x01, algorithm, 0x84, 0x01, descriptor.key_reference],
    );
    let response = guard.transport().transmit(&mse)?;
    if !response.is_success() {
        return Err(Error::UnexpectedStatus(response.status()));
    }

    // PSO: COMPUTE DIGITAL SIGNATURE
    let pso = Command::new_with_data(0x00, 0x2A, 0x9E, 0x9A, payload).with_le(0);
    let response = guard.transport().transmit(&pso)?;
    if response.status() != status::SW_NO_ERROR {
        return Err(Error::UnexpectedStatus(response.status()));
    }
    response
        .payload()
        .map(|p| p.to_vec())
        .ok_or(Error::InvalidData("signature without payload"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{acos::AcosDriver, starcos::StarcosDriver};
    use citizencard_apdu_core::MockTransport;

    #[test]
    fn pin_block_padding_and_bounds() {
        let driver = StarcosDriver::new();
        let desc = driver.pin(PinKind::Signature).unwrap();

        let block = pin_block(desc, Some(&SecretPin::from("123456"))).unwrap();
        assert_eq!(block.len(), PIN_BLOCK_LEN);
        assert_eq!(&block[..6], b"123456");
        assert!(block[6..].iter().all(|&b| b == desc.pad_char));

        assert!(pin_block(desc, Some(&SecretPin::from("12"))).is_err());
        assert!(pin_block(desc, Some(&SecretPin::from("123456789012345"))).is_err());

        let empty = pin_block(desc, None).unwrap();
        assert!(empty.iter().all(|&b| b == desc.pad_char));
    }

    #[test]
    fn starcos_acos_algo_id_tables_differ() {
        // The newer OS ORs a fixup bit into the algorithm id for SHA-256;
        // the older one keeps a single id per padding scheme. Observed on
        // hardware, kept per-variant on purpose.
        let starcos = StarcosDriver::new();
        let acos = AcosDriver::new();

        let starcos_sha1 = starcos
            .signature_algorithm_id(DigestAlgorithm::Sha1, PaddingScheme::Pkcs1V15)
            .unwrap();
        let starcos_sha256 = starcos
            .signature_algorithm_id(DigestAlgorithm::Sha256, PaddingScheme::Pkcs1V15)
            .unwrap();
        assert_eq!(starcos_sha256, starcos_sha1 | 0x10);

        let acos_sha1 = acos
            .signature_algorithm_id(DigestAlgorithm::Sha1, PaddingScheme::Pkcs1V15)
            .unwrap();
        let acos_sha256 = acos
            .signature_algorithm_id(DigestAlgorithm::Sha256, PaddingScheme::Pkcs1V15)
            .unwrap();
        assert_eq!(acos_sha1, acos_sha256);

        // PSS never made it to the older OS
        assert!(acos
            .signature_algorithm_id(DigestAlgorithm::Sha256, PaddingScheme::Pss)
            .is_none());
    }

    #[test]
    fn digest_info_prefixes_pkcs1_only() {
        let driver = StarcosDriver::new();
        let hash = [0xAB; 32];

        let pkcs1 = driver
            .digest_info(DigestAlgorithm::Sha256, PaddingScheme::Pkcs1V15, &hash)
            .unwrap();
        assert!(pkcs1.len() > hash.len());
        assert!(pkcs1.ends_with(&hash));

        let pss = driver
            .digest_info(DigestAlgorithm::Sha256, PaddingScheme::Pss, &hash)
            .unwrap();
        assert_eq!(pss, hash);
    }

    #[test]
    fn select_file_parses_fci_size() {
        let driver = StarcosDriver::new();
        let file = driver.file("D001").unwrap().clone();

        let mut transport = MockTransport::new("Mock", vec![]);
        // FCP template declaring a size of 0x0200
        transport.push_response(&[0x62, 0x04, 0x80, 0x02, 0x02, 0x00, 0x90, 0x00][..]);
        let size = driver.select_file(&mut transport, &file).unwrap();
        assert_eq!(size, Some(0x200));

        // Unknown size is a sentinel, not an error
        transport.push_response(&[0x90, 0x00][..]);
        let size = driver.select_file(&mut transport, &file).unwrap();
        assert_eq!(size, None);

        // Unexpected status word is an error
        transport.push_response(&[0x6A, 0x82][..]);
        assert!(matches!(
            driver.select_file(&mut transport, &file),
            Err(Error::UnexpectedStatus(sw)) if sw == status::SW_FILE_NOT_FOUND
        ));
    }

    #[test]
    fn read_binary_chunks_until_length() {
        let driver = StarcosDriver::new();
        let mut transport = MockTransport::new("Mock", vec![]);

        let mut first = vec![0x11; 256];
        first.extend_from_slice(&[0x90, 0x00]);
        transport.push_response(first);
        let mut second = vec![0x22; 44];
        second.extend_from_slice(&[0x90, 0x00]);
        transport.push_response(second);

        let data = driver.read_binary(&mut transport, 0, Some(300)).unwrap();
        assert_eq!(data.len(), 300);
        assert_eq!(data[0], 0x11);
        assert_eq!(data[299], 0x22);

        // Second READ BINARY starts at offset 256
        let cmd = &transport.commands[1];
        assert_eq!(&cmd[..4], &[0x00, 0xB0, 0x01, 0x00]);
    }

    #[test]
    fn read_binary_tolerates_overlong_chunk() {
        let driver = StarcosDriver::new();
        let mut transport = MockTransport::new("Mock", vec![]);

        // Asked for 4 bytes, the card answers with 8
        let mut response = vec![0x33; 8];
        response.extend_from_slice(&[0x90, 0x00]);
        transport.push_response(response);

        let data = driver.read_binary(&mut transport, 0, Some(4)).unwrap();
        assert_eq!(data, vec![0x33; 4]);
        assert_eq!(transport.commands.len(), 1);
    }

    #[test]
    fn get_challenge_requires_eight_bytes() {
        let driver = AcosDriver::new();
        let mut transport = MockTransport::new("Mock", vec![]);

        transport.push_response(&[1, 2, 3, 4, 5, 6, 7, 8, 0x90, 0x00][..]);
        assert_eq!(
            driver.get_challenge(&mut transport).unwrap(),
            [1, 2, 3, 4, 5, 6, 7, 8]
        );

        transport.push_response(&[1, 2, 3, 0x90, 0x00][..]);
        assert!(driver.get_challenge(&mut transport).is_err());
    }

    #[test]
    fn random_bytes_concatenates_challenges() {
        let driver = AcosDriver::new();
        let mut transport = MockTransport::new("Mock", vec![]);
        transport.push_response(&[1, 2, 3, 4, 5, 6, 7, 8, 0x90, 0x00][..]);
        transport.push_response(&[9, 10, 11, 12, 13, 14, 15, 16, 0x90, 0x00][..]);

        let bytes = driver.random_bytes(&mut transport, 11).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn sign_sequence_selects_verifies_and_signs() {
        use crate::config::EngineConfig;
        use crate::pin_flow::{Collected, CollectedChange, PinCollector, PinFlowController};
        use std::sync::Arc;

        struct FixedPin;
        impl PinCollector for FixedPin {
            fn collect_pin(&self, _: &PinDescriptor, _: &FlowSession) -> Collected {
                Collected::Pin(SecretPin::from("123456"))
            }
            fn collect_pin_change(&self, _: &PinDescriptor, _: &FlowSession) -> CollectedChange {
                CollectedChange::Cancelled
            }
        }

        let driver = StarcosDriver::new();
        let mut transport = MockTransport::new("Mock", vec![]);
        transport.push_response(&[0x90, 0x00][..]); // SELECT application
        transport.push_response(&[0x90, 0x00][..]); // VERIFY
        transport.push_response(&[0x90, 0x00][..]); // MSE SET
        transport.push_response(&[0xAA, 0xBB, 0x90, 0x00][..]); // PSO

        let flow = PinFlowController::new(EngineConfig::new(), Arc::new(FixedPin));
        let request = SignRequest {
            hash: vec![0xCD; 32],
            digest: DigestAlgorithm::Sha256,
            padding: PaddingScheme::Pkcs1V15,
            key: PinKind::Signature,
            external_pin: None,
        };
        let signature = sign(
            &driver,
            &mut transport,
            &flow,
            &request,
            &FlowSession::default(),
        )
        .unwrap();
        assert_eq!(signature, vec![0xAA, 0xBB]);

        assert_eq!(transport.commands.len(), 4);
        assert_eq!(&transport.commands[0][..4], &[0x00, 0xA4, 0x04, 0x0C]);
        assert_eq!(transport.commands[1][1], 0x20);
        // MSE picks the SHA-256 algorithm id and the signature key reference
        assert_eq!(
            transport.commands[2][5..],
            [0x80, 0x01, 0x12, 0x84, 0x01, 0x04]
        );
        assert_eq!(&transport.commands[3][..4], &[0x00, 0x2A, 0x9E, 0x9A]);
        assert_eq!(transport.begin_exclusive_calls, 1);
        assert_eq!(transport.end_exclusive_calls, 1);
    }

    #[test]
    fn modify_apdu_shapes_follow_verify_to_modify() {
        let starcos = StarcosDriver::new();
        let acos = AcosDriver::new();
        let s_desc = starcos.pin(PinKind::Signature).unwrap();
        let a_desc = acos.pin(PinKind::Signature).unwrap();

        let new_pin = SecretPin::from("123456");
        let old_pin = SecretPin::from("654321");

        // Separate-verify variant: one block, P1 = 01
        let cmd = starcos
            .fill_modify_pin_apdu(s_desc, None, &new_pin)
            .unwrap();
        assert_eq!(cmd.p1, 0x01);
        assert_eq!(cmd.data.as_ref().unwrap().len(), PIN_BLOCK_LEN);

        // Combined variant: old block required, two blocks, P1 = 00
        assert!(acos.fill_modify_pin_apdu(a_desc, None, &new_pin).is_err());
        let cmd = acos
            .fill_modify_pin_apdu(a_desc, Some(&old_pin), &new_pin)
            .unwrap();
        assert_eq!(cmd.p1, 0x00);
        assert_eq!(cmd.data.as_ref().unwrap().len(), 2 * PIN_BLOCK_LEN);
    }
}
