//! Implements the EAP-PSK authentication method (RFC 4764) as used by G3-PLC bootstrapping.
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
//!
//! # Description
//! This crate covers the key hierarchy (AK/KDK from the PSK, TEK from the peer nonce) and the
//! fixed-layout encoding of the four EAP-PSK messages, including the EAX-protected P-Channel.
//! The AES, CMAC and EAX primitives come from the RustCrypto crates. Framing inside LBP and the
//! handshake state machines live in the firmware crate.
#![no_std]

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use bit_field::BitField;
use cmac::{Cmac, Mac};
use eax::aead::AeadInPlace;
use eax::Eax;
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A 128-bit key (PSK, AK, KDK, TEK or GMK).
pub type Key = [u8; 16];

/// A 128-bit random challenge (RAND_S or RAND_P).
pub type Rand = [u8; 16];

/// The EAP method type assigned to EAP-PSK.
pub const EAP_TYPE_PSK: u8 = 47;

/// The smallest valid first message: EAP header, type, flags and RAND_S.
pub const FIRST_MSG_MIN_LEN: usize = 22;

/// Length of the EAP header of request and response packets, including the type byte.
const HEADER_LEN: usize = 5;

/// Offset of RAND_S in every EAP-PSK message.
const RAND_S_OFFSET: usize = 6;

/// Bytes covered by the EAX header: EAP header, flags and RAND_S.
const AAD_LEN: usize = 22;

const MAC_LEN: usize = 16;
const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 4;

const SECOND_MSG_MIN_LEN: usize = AAD_LEN + 16 + MAC_LEN;
const THIRD_MSG_PCHANNEL_OFFSET: usize = AAD_LEN + MAC_LEN;
const FOURTH_MSG_PCHANNEL_OFFSET: usize = AAD_LEN;

/// Length of a P-Channel without extension: nonce, tag and the flags byte.
const PCHANNEL_MIN_LEN: usize = NONCE_LEN + TAG_LEN + 1;

/// Errors reported while building or parsing EAP-PSK messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The buffer is too short for the message.
    Length,
    /// A header field carries an unexpected value.
    Format,
    /// RAND_S was not echoed back by the peer.
    Rand,
    /// MAC_P or MAC_S did not verify.
    Mac,
    /// The EAX tag of the P-Channel did not verify.
    Tag,
    /// The P-Channel nonce is not the expected one.
    Nonce,
}

/// EAP packet codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Code {
    Request = 1,
    Response = 2,
    Success = 3,
    Failure = 4,
}

impl TryFrom<u8> for Code {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            1 => Ok(Code::Request),
            2 => Ok(Code::Response),
            3 => Ok(Code::Success),
            4 => Ok(Code::Failure),
            _ => Err(Error::Format),
        }
    }
}

/// The T subtype carried in the EAP-PSK flags byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Subtype {
    First = 0,
    Second = 1,
    Third = 2,
    Fourth = 3,
}

impl Subtype {
    fn from_flags(flags: u8) -> Self {
        match flags.get_bits(6..8) {
            0 => Subtype::First,
            1 => Subtype::Second,
            2 => Subtype::Third,
            _ => Subtype::Fourth,
        }
    }

    fn flags(self) -> u8 {
        let mut flags = 0u8;
        flags.set_bits(6..8, self as u8);
        flags
    }
}

/// The result indication (R field) of a P-Channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PChannelResult {
    Continue = 1,
    DoneSuccess = 2,
    DoneFailure = 3,
}

impl TryFrom<u8> for PChannelResult {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            1 => Ok(PChannelResult::Continue),
            2 => Ok(PChannelResult::DoneSuccess),
            3 => Ok(PChannelResult::DoneFailure),
            _ => Err(Error::Format),
        }
    }
}

/// The fixed EAP header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub code: Code,
    pub identifier: u8,
    pub length: u16,
}

impl Header {
    /// Parse the EAP header at the start of `msg`.
    ///
    /// # Note
    /// The length field must not exceed the available data.
    pub fn decode(msg: &[u8]) -> Result<Self, Error> {
        if msg.len() < 4 {
            return Err(Error::Length);
        }

        let length = u16::from_be_bytes([msg[2], msg[3]]);
        if (length as usize) > msg.len() || length < 4 {
            return Err(Error::Length);
        }

        Ok(Header {
            code: Code::try_from(msg[0])?,
            identifier: msg[1],
            length,
        })
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.code as u8;
        buf[1] = self.identifier;
        buf[2..4].copy_from_slice(&self.length.to_be_bytes());
    }
}

/// Determine which EAP-PSK message `msg` carries.
///
/// # Returns
/// The EAP header and, for request/response packets of type EAP-PSK, the message subtype.
pub fn classify(msg: &[u8]) -> Result<(Header, Option<Subtype>), Error> {
    let header = Header::decode(msg)?;
    match header.code {
        Code::Request | Code::Response => {
            if msg.len() < HEADER_LEN + 1 {
                return Err(Error::Length);
            }
            if msg[4] != EAP_TYPE_PSK {
                return Err(Error::Format);
            }
            Ok((header, Some(Subtype::from_flags(msg[5]))))
        }
        Code::Success | Code::Failure => Ok((header, None)),
    }
}

/// The key material of one EAP-PSK handshake.
///
/// # Note
/// The keys are wiped when the context is dropped or explicitly zeroized.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct PskContext {
    kdk: Key,
    ak: Key,
    tek: Key,
}

impl core::fmt::Debug for PskContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("PskContext { .. }")
    }
}

fn aes_block(key: &Key, input: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::clone_from_slice(input);
    cipher.encrypt_block(&mut block);

    let mut output = [0u8; 16];
    output.copy_from_slice(&block);
    output
}

/// XOR a counter value into the last byte of a block.
fn with_counter(mut block: [u8; 16], counter: u8) -> [u8; 16] {
    block[15] ^= counter;
    block
}

fn cmac(key: &Key, parts: &[&[u8]]) -> [u8; MAC_LEN] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
    for part in parts {
        mac.update(part);
    }

    let mut output = [0u8; MAC_LEN];
    output.copy_from_slice(&mac.finalize().into_bytes());
    output
}

fn cmac_verify(key: &Key, parts: &[&[u8]], expected: &[u8]) -> Result<(), Error> {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(expected).map_err(|_| Error::Mac)
}

impl PskContext {
    /// Derive AK and KDK from a pre-shared key.
    ///
    /// # Args
    /// * `psk` - The 16-byte pre-shared key of the peer.
    pub fn new(psk: &Key) -> Self {
        let c0 = aes_block(psk, &[0u8; 16]);

        PskContext {
            ak: aes_block(psk, &with_counter(c0, 1)),
            kdk: aes_block(psk, &with_counter(c0, 2)),
            tek: [0; 16],
        }
    }

    /// Derive the TEK from the peer challenge RAND_P.
    pub fn initialize_tek(&mut self, rand_p: &Rand) {
        let mut o = aes_block(&self.kdk, rand_p);
        self.tek = aes_block(&self.kdk, &with_counter(o, 1));
        o.zeroize();
    }

    /// The authentication key.
    pub fn ak(&self) -> &Key {
        &self.ak
    }

    /// The transient encryption key protecting the P-Channel.
    pub fn tek(&self) -> &Key {
        &self.tek
    }

    /// Compute MAC_P = CMAC(AK, ID_P || ID_S || RAND_S || RAND_P).
    fn mac_p(&self, id_p: &[u8], id_s: &[u8], rand_s: &Rand, rand_p: &Rand) -> [u8; MAC_LEN] {
        cmac(&self.ak, &[id_p, id_s, rand_s, rand_p])
    }

    /// Compute MAC_S = CMAC(AK, ID_S || RAND_P).
    fn mac_s(&self, id_s: &[u8], rand_p: &Rand) -> [u8; MAC_LEN] {
        cmac(&self.ak, &[id_s, rand_p])
    }

    fn eax_nonce(nonce: u32) -> [u8; 16] {
        let mut eax_nonce = [0u8; 16];
        eax_nonce[12..].copy_from_slice(&nonce.to_be_bytes());
        eax_nonce
    }

    /// Encrypt the P-Channel payload in place.
    ///
    /// # Returns
    /// The EAX authentication tag.
    fn seal(&self, aad: &[u8], nonce: u32, payload: &mut [u8]) -> Result<[u8; TAG_LEN], Error> {
        let cipher = Eax::<Aes128>::new(GenericArray::from_slice(&self.tek));
        let eax_nonce = Self::eax_nonce(nonce);
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&eax_nonce), aad, payload)
            .map_err(|_| Error::Length)?;

        let mut output = [0u8; TAG_LEN];
        output.copy_from_slice(&tag);
        Ok(output)
    }

    /// Authenticate and decrypt the P-Channel payload in place.
    fn open(&self, aad: &[u8], nonce: u32, payload: &mut [u8], tag: &[u8]) -> Result<(), Error> {
        let cipher = Eax::<Aes128>::new(GenericArray::from_slice(&self.tek));
        let eax_nonce = Self::eax_nonce(nonce);
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&eax_nonce),
                aad,
                payload,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| Error::Tag)
    }
}

/// An optional P-Channel extension.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Extension<'a> {
    pub ext_type: u8,
    pub payload: &'a [u8],
}

/// The decrypted content of a P-Channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PChannel<'a> {
    pub nonce: u32,
    pub result: PChannelResult,
    pub extension: Option<Extension<'a>>,
}

fn read_rand(msg: &[u8], offset: usize) -> Rand {
    let mut rand = [0u8; 16];
    rand.copy_from_slice(&msg[offset..offset + 16]);
    rand
}

fn write_header(buf: &mut [u8], code: Code, identifier: u8, length: usize, subtype: Subtype) {
    Header {
        code,
        identifier,
        length: length as u16,
    }
    .encode(buf);
    buf[4] = EAP_TYPE_PSK;
    buf[5] = subtype.flags();
}

/// Validate the common part of an EAP-PSK message and trim it to its EAP length.
fn check_message(msg: &[u8], code: Code, subtype: Subtype, min_len: usize) -> Result<usize, Error> {
    let (header, kind) = classify(msg)?;
    if header.code != code || kind != Some(subtype) {
        return Err(Error::Format);
    }

    let length = header.length as usize;
    if length < min_len {
        return Err(Error::Length);
    }

    Ok(length)
}

fn pchannel_len(extension: Option<&Extension<'_>>) -> usize {
    PCHANNEL_MIN_LEN + extension.map(|ext| 1 + ext.payload.len()).unwrap_or(0)
}

/// Write and seal a P-Channel at `offset`. The EAP header must already be in place.
fn write_pchannel(
    buf: &mut [u8],
    offset: usize,
    context: &PskContext,
    nonce: u32,
    result: PChannelResult,
    extension: Option<&Extension<'_>>,
) -> Result<(), Error> {
    let mut aad = [0u8; AAD_LEN];
    aad.copy_from_slice(&buf[..AAD_LEN]);

    buf[offset..offset + NONCE_LEN].copy_from_slice(&nonce.to_be_bytes());

    let flags_offset = offset + NONCE_LEN + TAG_LEN;
    let mut flags = 0u8;
    flags.set_bits(6..8, result as u8);
    flags.set_bit(5, extension.is_some());
    buf[flags_offset] = flags;

    let mut end = flags_offset + 1;
    if let Some(ext) = extension {
        buf[end] = ext.ext_type;
        buf[end + 1..end + 1 + ext.payload.len()].copy_from_slice(ext.payload);
        end += 1 + ext.payload.len();
    }

    let tag = context.seal(&aad, nonce, &mut buf[flags_offset..end])?;
    buf[offset + NONCE_LEN..flags_offset].copy_from_slice(&tag);

    Ok(())
}

/// Authenticate and decrypt the P-Channel of `msg` starting at `offset`.
fn read_pchannel<'a>(
    msg: &'a mut [u8],
    offset: usize,
    context: &PskContext,
    expected_nonce: u32,
) -> Result<PChannel<'a>, Error> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&msg[offset..offset + NONCE_LEN]);
    let nonce = u32::from_be_bytes(nonce_bytes);

    if nonce != expected_nonce {
        return Err(Error::Nonce);
    }

    let mut aad = [0u8; AAD_LEN];
    aad.copy_from_slice(&msg[..AAD_LEN]);

    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&msg[offset + NONCE_LEN..offset + NONCE_LEN + TAG_LEN]);

    let flags_offset = offset + NONCE_LEN + TAG_LEN;
    context.open(&aad, nonce, &mut msg[flags_offset..], &tag)?;

    let msg: &'a [u8] = msg;
    let flags = msg[flags_offset];
    let result = PChannelResult::try_from(flags.get_bits(6..8))?;

    let extension = if flags.get_bit(5) {
        let ext = &msg[flags_offset + 1..];
        if ext.is_empty() {
            return Err(Error::Length);
        }
        Some(Extension {
            ext_type: ext[0],
            payload: &ext[1..],
        })
    } else {
        None
    };

    Ok(PChannel {
        nonce,
        result,
        extension,
    })
}

/// Encode the first message (server to peer).
///
/// # Args
/// * `buf` - The output buffer.
/// * `identifier` - The EAP identifier chosen by the server.
/// * `id_s` - The server identity.
/// * `rng` - Source of the fresh RAND_S.
///
/// # Returns
/// The message length and the generated RAND_S.
pub fn encode_message1<R: RngCore + CryptoRng>(
    buf: &mut [u8],
    identifier: u8,
    id_s: &[u8],
    rng: &mut R,
) -> Result<(usize, Rand), Error> {
    let length = FIRST_MSG_MIN_LEN + id_s.len();
    if buf.len() < length {
        return Err(Error::Length);
    }

    let mut rand_s = [0u8; 16];
    rng.fill_bytes(&mut rand_s);

    write_header(buf, Code::Request, identifier, length, Subtype::First);
    buf[RAND_S_OFFSET..AAD_LEN].copy_from_slice(&rand_s);
    buf[AAD_LEN..length].copy_from_slice(id_s);

    Ok((length, rand_s))
}

/// The content of a first message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Message1<'a> {
    pub identifier: u8,
    pub rand_s: Rand,
    pub id_s: &'a [u8],
}

/// Parse the first message (peer side).
pub fn decode_message1(msg: &[u8]) -> Result<Message1<'_>, Error> {
    let length = check_message(msg, Code::Request, Subtype::First, FIRST_MSG_MIN_LEN)?;

    Ok(Message1 {
        identifier: msg[1],
        rand_s: read_rand(msg, RAND_S_OFFSET),
        id_s: &msg[AAD_LEN..length],
    })
}

/// Encode the second message (peer to server).
///
/// # Note
/// A fresh RAND_P is drawn and the TEK of `context` is derived from it.
///
/// # Args
/// * `buf` - The output buffer.
/// * `identifier` - The identifier of the first message being answered.
/// * `context` - The peer key context, initialized from its PSK.
/// * `rand_s` - RAND_S of the first message.
/// * `id_s` - The server identity of the first message.
/// * `id_p` - The peer identity.
/// * `rng` - Source of the fresh RAND_P.
///
/// # Returns
/// The message length and the generated RAND_P.
pub fn encode_message2<R: RngCore + CryptoRng>(
    buf: &mut [u8],
    identifier: u8,
    context: &mut PskContext,
    rand_s: &Rand,
    id_s: &[u8],
    id_p: &[u8],
    rng: &mut R,
) -> Result<(usize, Rand), Error> {
    let length = SECOND_MSG_MIN_LEN + id_p.len();
    if buf.len() < length {
        return Err(Error::Length);
    }

    let mut rand_p = [0u8; 16];
    rng.fill_bytes(&mut rand_p);
    context.initialize_tek(&rand_p);

    let mac_p = context.mac_p(id_p, id_s, rand_s, &rand_p);

    write_header(buf, Code::Response, identifier, length, Subtype::Second);
    buf[RAND_S_OFFSET..AAD_LEN].copy_from_slice(rand_s);
    buf[AAD_LEN..AAD_LEN + 16].copy_from_slice(&rand_p);
    buf[AAD_LEN + 16..SECOND_MSG_MIN_LEN].copy_from_slice(&mac_p);
    buf[SECOND_MSG_MIN_LEN..length].copy_from_slice(id_p);

    Ok((length, rand_p))
}

/// The content of a second message, before authentication.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Message2<'a> {
    pub identifier: u8,
    pub rand_s: Rand,
    pub rand_p: Rand,
    pub mac_p: [u8; MAC_LEN],
    pub id_p: &'a [u8],
}

/// Parse the second message and check that RAND_S was echoed.
///
/// # Note
/// The message is not authenticated yet: the server has to resolve the PSK of `id_p` and then
/// call [decode_message2_step2].
pub fn decode_message2_step1<'a>(msg: &'a [u8], rand_s: &Rand) -> Result<Message2<'a>, Error> {
    let length = check_message(msg, Code::Response, Subtype::Second, SECOND_MSG_MIN_LEN)?;

    let echoed = read_rand(msg, RAND_S_OFFSET);
    if echoed != *rand_s {
        return Err(Error::Rand);
    }

    let mut mac_p = [0u8; MAC_LEN];
    mac_p.copy_from_slice(&msg[AAD_LEN + 16..SECOND_MSG_MIN_LEN]);

    Ok(Message2 {
        identifier: msg[1],
        rand_s: echoed,
        rand_p: read_rand(msg, AAD_LEN),
        mac_p,
        id_p: &msg[SECOND_MSG_MIN_LEN..length],
    })
}

/// Verify MAC_P of a second message and derive the TEK on success.
///
/// # Args
/// * `context` - The key context initialized from the PSK of the peer.
/// * `msg` - The output of [decode_message2_step1].
/// * `id_s` - The server identity.
pub fn decode_message2_step2(
    context: &mut PskContext,
    msg: &Message2<'_>,
    id_s: &[u8],
) -> Result<(), Error> {
    cmac_verify(
        &context.ak,
        &[msg.id_p, id_s, &msg.rand_s, &msg.rand_p],
        &msg.mac_p,
    )?;

    context.initialize_tek(&msg.rand_p);
    Ok(())
}

/// Encode the third message (server to peer).
///
/// # Args
/// * `buf` - The output buffer.
/// * `identifier` - The EAP identifier chosen by the server.
/// * `context` - The server key context with the TEK derived.
/// * `rand_s` - RAND_S of this handshake.
/// * `rand_p` - RAND_P of the second message.
/// * `id_s` - The server identity.
/// * `nonce` - The P-Channel nonce.
/// * `result` - The P-Channel result indication.
/// * `extension` - The protected extension, typically configuration parameters.
///
/// # Returns
/// The message length.
#[allow(clippy::too_many_arguments)]
pub fn encode_message3(
    buf: &mut [u8],
    identifier: u8,
    context: &PskContext,
    rand_s: &Rand,
    rand_p: &Rand,
    id_s: &[u8],
    nonce: u32,
    result: PChannelResult,
    extension: Option<&Extension<'_>>,
) -> Result<usize, Error> {
    let length = THIRD_MSG_PCHANNEL_OFFSET + pchannel_len(extension);
    if buf.len() < length {
        return Err(Error::Length);
    }

    write_header(buf, Code::Request, identifier, length, Subtype::Third);
    buf[RAND_S_OFFSET..AAD_LEN].copy_from_slice(rand_s);
    buf[AAD_LEN..THIRD_MSG_PCHANNEL_OFFSET].copy_from_slice(&context.mac_s(id_s, rand_p));
    write_pchannel(
        &mut buf[..length],
        THIRD_MSG_PCHANNEL_OFFSET,
        context,
        nonce,
        result,
        extension,
    )?;

    Ok(length)
}

/// The content of a third message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Message3<'a> {
    pub identifier: u8,
    pub pchannel: PChannel<'a>,
}

/// Authenticate and decrypt the third message (peer side).
///
/// # Note
/// The P-Channel is decrypted in place, so `msg` is modified even when decoding fails.
///
/// # Args
/// * `msg` - The received message.
/// * `context` - The peer key context with the TEK derived.
/// * `rand_s` - RAND_S of the first message.
/// * `rand_p` - RAND_P sent in the second message.
/// * `id_s` - The server identity.
///
/// # Note
/// The server opens the P-Channel with nonce 0. Any other nonce is rejected.
pub fn decode_message3<'a>(
    msg: &'a mut [u8],
    context: &PskContext,
    rand_s: &Rand,
    rand_p: &Rand,
    id_s: &[u8],
) -> Result<Message3<'a>, Error> {
    let length = check_message(
        msg,
        Code::Request,
        Subtype::Third,
        THIRD_MSG_PCHANNEL_OFFSET + PCHANNEL_MIN_LEN,
    )?;
    let msg = &mut msg[..length];

    if read_rand(msg, RAND_S_OFFSET) != *rand_s {
        return Err(Error::Rand);
    }

    let expected = context.mac_s(id_s, rand_p);
    if !constant_time_eq(&expected, &msg[AAD_LEN..THIRD_MSG_PCHANNEL_OFFSET]) {
        return Err(Error::Mac);
    }

    let identifier = msg[1];
    let pchannel = read_pchannel(msg, THIRD_MSG_PCHANNEL_OFFSET, context, 0)?;

    Ok(Message3 {
        identifier,
        pchannel,
    })
}

/// Encode the fourth message (peer to server).
///
/// # Args
/// * `buf` - The output buffer.
/// * `identifier` - The identifier of the third message being answered.
/// * `context` - The peer key context with the TEK derived.
/// * `rand_s` - RAND_S of this handshake.
/// * `nonce` - The P-Channel nonce, one more than the nonce of the third message.
/// * `result` - The P-Channel result indication.
/// * `extension` - The protected extension, typically the parameter result.
pub fn encode_message4(
    buf: &mut [u8],
    identifier: u8,
    context: &PskContext,
    rand_s: &Rand,
    nonce: u32,
    result: PChannelResult,
    extension: Option<&Extension<'_>>,
) -> Result<usize, Error> {
    let length = FOURTH_MSG_PCHANNEL_OFFSET + pchannel_len(extension);
    if buf.len() < length {
        return Err(Error::Length);
    }

    write_header(buf, Code::Response, identifier, length, Subtype::Fourth);
    buf[RAND_S_OFFSET..AAD_LEN].copy_from_slice(rand_s);
    write_pchannel(
        &mut buf[..length],
        FOURTH_MSG_PCHANNEL_OFFSET,
        context,
        nonce,
        result,
        extension,
    )?;

    Ok(length)
}

/// The content of a fourth message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Message4<'a> {
    pub identifier: u8,
    pub pchannel: PChannel<'a>,
}

/// Authenticate and decrypt the fourth message (server side).
///
/// # Note
/// A nonce other than `expected_nonce` is rejected before any decryption takes place.
///
/// # Args
/// * `msg` - The received message, decrypted in place.
/// * `context` - The server key context with the TEK derived.
/// * `rand_s` - RAND_S of this handshake.
/// * `expected_nonce` - The nonce the server expects from the peer.
pub fn decode_message4<'a>(
    msg: &'a mut [u8],
    context: &PskContext,
    rand_s: &Rand,
    expected_nonce: u32,
) -> Result<Message4<'a>, Error> {
    let length = check_message(
        msg,
        Code::Response,
        Subtype::Fourth,
        FOURTH_MSG_PCHANNEL_OFFSET + PCHANNEL_MIN_LEN,
    )?;
    let msg = &mut msg[..length];

    if read_rand(msg, RAND_S_OFFSET) != *rand_s {
        return Err(Error::Rand);
    }

    let identifier = msg[1];
    let pchannel = read_pchannel(msg, FOURTH_MSG_PCHANNEL_OFFSET, context, expected_nonce)?;

    Ok(Message4 {
        identifier,
        pchannel,
    })
}

/// Encode an EAP-Success or EAP-Failure packet.
pub fn encode_result(buf: &mut [u8], code: Code, identifier: u8) -> Result<usize, Error> {
    if !matches!(code, Code::Success | Code::Failure) {
        return Err(Error::Format);
    }
    if buf.len() < 4 {
        return Err(Error::Length);
    }

    Header {
        code,
        identifier,
        length: 4,
    }
    .encode(buf);
    Ok(4)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const PSK: Key = [
        0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd,
        0xef,
    ];
    const ID_S: &[u8] = b"LBS-COORD";
    const ID_P: &[u8] = &[0x00, 0x80, 0xe1, 0x01, 0x02, 0x03, 0x04, 0x05];

    struct Handshake {
        server: PskContext,
        peer: PskContext,
        rand_s: Rand,
        rand_p: Rand,
    }

    fn run_to_message2(rng: &mut ChaCha8Rng) -> Handshake {
        let mut buf = [0u8; 128];
        let (len, rand_s) = encode_message1(&mut buf, 7, ID_S, rng).unwrap();
        let first = decode_message1(&buf[..len]).unwrap();
        assert_eq!(first.id_s, ID_S);
        assert_eq!(first.identifier, 7);

        let mut peer = PskContext::new(&PSK);
        let mut reply = [0u8; 128];
        let (len, rand_p) =
            encode_message2(&mut reply, 7, &mut peer, &first.rand_s, first.id_s, ID_P, rng)
                .unwrap();

        let second = decode_message2_step1(&reply[..len], &rand_s).unwrap();
        assert_eq!(second.id_p, ID_P);
        let mut server = PskContext::new(&PSK);
        decode_message2_step2(&mut server, &second, ID_S).unwrap();

        Handshake {
            server,
            peer,
            rand_s,
            rand_p,
        }
    }

    #[test]
    fn key_derivation_is_deterministic() {
        let a = PskContext::new(&PSK);
        let b = PskContext::new(&PSK);
        assert_eq!(a.ak(), b.ak());
        assert_ne!(a.ak(), &a.kdk);
        assert_ne!(a.ak(), &[0u8; 16]);
    }

    #[test]
    fn both_sides_derive_the_same_tek() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let handshake = run_to_message2(&mut rng);
        assert_eq!(handshake.server.tek(), handshake.peer.tek());
        assert_ne!(handshake.server.tek(), &[0u8; 16]);
    }

    #[test]
    fn first_message_rejects_short_input() {
        let msg = [1u8, 1, 0, 21, EAP_TYPE_PSK, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode_message1(&msg), Err(Error::Length));
    }

    #[test]
    fn second_message_with_wrong_psk_fails() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut buf = [0u8; 128];
        let (len, rand_s) = encode_message1(&mut buf, 1, ID_S, &mut rng).unwrap();
        let first = decode_message1(&buf[..len]).unwrap();

        let mut peer = PskContext::new(&[0x55; 16]);
        let mut reply = [0u8; 128];
        let (len, _) =
            encode_message2(&mut reply, 1, &mut peer, &first.rand_s, ID_S, ID_P, &mut rng)
                .unwrap();

        let second = decode_message2_step1(&reply[..len], &rand_s).unwrap();
        let mut server = PskContext::new(&PSK);
        assert_eq!(
            decode_message2_step2(&mut server, &second, ID_S),
            Err(Error::Mac)
        );
    }

    #[test]
    fn second_message_must_echo_rand_s() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut peer = PskContext::new(&PSK);
        let mut reply = [0u8; 128];
        let (len, _) =
            encode_message2(&mut reply, 1, &mut peer, &[9; 16], ID_S, ID_P, &mut rng).unwrap();
        assert_eq!(
            decode_message2_step1(&reply[..len], &[8; 16]),
            Err(Error::Rand)
        );
    }

    #[test]
    fn third_and_fourth_message_exchange() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let handshake = run_to_message2(&mut rng);

        let params = [0x77, 0x02, 0x00, 0x05];
        let mut third = [0u8; 128];
        let len = encode_message3(
            &mut third,
            8,
            &handshake.server,
            &handshake.rand_s,
            &handshake.rand_p,
            ID_S,
            0,
            PChannelResult::DoneSuccess,
            Some(&Extension {
                ext_type: 2,
                payload: &params,
            }),
        )
        .unwrap();

        let decoded = decode_message3(
            &mut third[..len],
            &handshake.peer,
            &handshake.rand_s,
            &handshake.rand_p,
            ID_S,
        )
        .unwrap();
        assert_eq!(decoded.identifier, 8);
        assert_eq!(decoded.pchannel.nonce, 0);
        assert_eq!(decoded.pchannel.result, PChannelResult::DoneSuccess);
        let ext = decoded.pchannel.extension.unwrap();
        assert_eq!(ext.ext_type, 2);
        assert_eq!(ext.payload, &params);

        let mut fourth = [0u8; 64];
        let len = encode_message4(
            &mut fourth,
            8,
            &handshake.peer,
            &handshake.rand_s,
            1,
            PChannelResult::DoneSuccess,
            None,
        )
        .unwrap();

        let mut copy = fourth;
        let decoded =
            decode_message4(&mut copy[..len], &handshake.server, &handshake.rand_s, 1).unwrap();
        assert_eq!(decoded.pchannel.nonce, 1);
        assert_eq!(decoded.pchannel.extension, None);

        // Once the server moved on, the same message is a replay.
        let mut replay = fourth;
        assert_eq!(
            decode_message4(&mut replay[..len], &handshake.server, &handshake.rand_s, 3),
            Err(Error::Nonce)
        );
    }

    #[test]
    fn third_message_requires_initial_nonce() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let handshake = run_to_message2(&mut rng);

        let mut third = [0u8; 64];
        let len = encode_message3(
            &mut third,
            3,
            &handshake.server,
            &handshake.rand_s,
            &handshake.rand_p,
            ID_S,
            5,
            PChannelResult::DoneSuccess,
            None,
        )
        .unwrap();

        assert_eq!(
            decode_message3(
                &mut third[..len],
                &handshake.peer,
                &handshake.rand_s,
                &handshake.rand_p,
                ID_S,
            )
            .map(|message| message.identifier),
            Err(Error::Nonce)
        );
    }

    #[test]
    fn corrupted_pchannel_is_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let handshake = run_to_message2(&mut rng);

        let mut third = [0u8; 128];
        let len = encode_message3(
            &mut third,
            2,
            &handshake.server,
            &handshake.rand_s,
            &handshake.rand_p,
            ID_S,
            0,
            PChannelResult::DoneSuccess,
            Some(&Extension {
                ext_type: 2,
                payload: &[1, 2, 3, 4],
            }),
        )
        .unwrap();

        third[len - 1] ^= 0x80;
        assert_eq!(
            decode_message3(
                &mut third[..len],
                &handshake.peer,
                &handshake.rand_s,
                &handshake.rand_p,
                ID_S
            ),
            Err(Error::Tag)
        );
    }

    #[test]
    fn header_layout() {
        let mut buf = [0u8; 4];
        assert_eq!(encode_result(&mut buf, Code::Failure, 0x42), Ok(4));
        assert_eq!(buf, [4, 0x42, 0, 4]);

        let (header, subtype) = classify(&buf).unwrap();
        assert_eq!(header.code, Code::Failure);
        assert_eq!(subtype, None);
        assert_eq!(
            encode_result(&mut buf, Code::Request, 0),
            Err(Error::Format)
        );
    }
}
