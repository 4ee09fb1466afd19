//! Security block: certificate chain and signature.
//!
//! ```text
//! SecurityBlock      := certificates<0..2^16-1> Signature
//! GenericCertificate := type(u8) certificate<0..2^16-1>
//! Signature          := hash_alg(u8) sig_alg(u8) SignerIdentity signature<0..2^16-1>
//! SignerIdentity     := type(u8) length(u16) value
//! ```
//!
//! Signatures cover `overlay ‖ transaction_id ‖ contents ‖ signer identity`,
//! where `contents` are the encoded message contents exactly as they appear
//! on the wire.

use crate::codec::{
    expect_drained, read_field, read_u8, write_field, write_opaque, Codec, CodecRegistry,
    FieldWidth, RegisteredCodec,
};
use crate::error::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Certificate type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificateType {
    /// X.509
    X509,
    /// Any other type, preserved
    Other(u8),
}

impl From<u8> for CertificateType {
    fn from(v: u8) -> Self {
        match v {
            0 => CertificateType::X509,
            other => CertificateType::Other(other),
        }
    }
}

impl From<CertificateType> for u8 {
    fn from(t: CertificateType) -> u8 {
        match t {
            CertificateType::X509 => 0,
            CertificateType::Other(v) => v,
        }
    }
}

/// Hash algorithm ids (TLS registry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// none
    None,
    /// md5
    Md5,
    /// sha1
    Sha1,
    /// sha224
    Sha224,
    /// sha256
    Sha256,
    /// sha384
    Sha384,
    /// sha512
    Sha512,
    /// Unassigned
    Other(u8),
}

impl From<u8> for HashAlgorithm {
    fn from(v: u8) -> Self {
        match v {
            0 => HashAlgorithm::None,
            1 => HashAlgorithm::Md5,
            2 => HashAlgorithm::Sha1,
            3 => HashAlgorithm::Sha224,
            4 => HashAlgorithm::Sha256,
            5 => HashAlgorithm::Sha384,
            6 => HashAlgorithm::Sha512,
            other => HashAlgorithm::Other(other),
        }
    }
}

impl From<HashAlgorithm> for u8 {
    fn from(h: HashAlgorithm) -> u8 {
        match h {
            HashAlgorithm::None => 0,
            HashAlgorithm::Md5 => 1,
            HashAlgorithm::Sha1 => 2,
            HashAlgorithm::Sha224 => 3,
            HashAlgorithm::Sha256 => 4,
            HashAlgorithm::Sha384 => 5,
            HashAlgorithm::Sha512 => 6,
            HashAlgorithm::Other(v) => v,
        }
    }
}

/// Signature algorithm ids (TLS registry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    /// anonymous
    Anonymous,
    /// rsa
    Rsa,
    /// dsa
    Dsa,
    /// ecdsa
    Ecdsa,
    /// Unassigned
    Other(u8),
}

impl From<u8> for SignatureAlgorithm {
    fn from(v: u8) -> Self {
        match v {
            0 => SignatureAlgorithm::Anonymous,
            1 => SignatureAlgorithm::Rsa,
            2 => SignatureAlgorithm::Dsa,
            3 => SignatureAlgorithm::Ecdsa,
            other => SignatureAlgorithm::Other(other),
        }
    }
}

impl From<SignatureAlgorithm> for u8 {
    fn from(s: SignatureAlgorithm) -> u8 {
        match s {
            SignatureAlgorithm::Anonymous => 0,
            SignatureAlgorithm::Rsa => 1,
            SignatureAlgorithm::Dsa => 2,
            SignatureAlgorithm::Ecdsa => 3,
            SignatureAlgorithm::Other(v) => v,
        }
    }
}

/// A certificate carried in the security block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericCertificate {
    /// Certificate type
    pub cert_type: CertificateType,
    /// DER or other encoded certificate
    pub certificate: Bytes,
}

/// Identity of the signer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerIdentity {
    /// Hash of the signer's certificate
    CertHash {
        /// Hash algorithm
        hash_alg: HashAlgorithm,
        /// Certificate hash
        hash: Bytes,
    },
    /// Hash of the certificate and the node id it was issued for
    CertHashNodeId {
        /// Hash algorithm
        hash_alg: HashAlgorithm,
        /// Hash value
        hash: Bytes,
    },
    /// Unsigned
    None,
}

impl SignerIdentity {
    /// Wire identity type
    pub fn identity_type(&self) -> u8 {
        match self {
            SignerIdentity::CertHash { .. } => 1,
            SignerIdentity::CertHashNodeId { .. } => 2,
            SignerIdentity::None => 3,
        }
    }

    /// Append the wire encoding
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u8(self.identity_type());
        write_field(buf, FieldWidth::U16, |buf| {
            match self {
                SignerIdentity::CertHash { hash_alg, hash }
                | SignerIdentity::CertHashNodeId { hash_alg, hash } => {
                    buf.put_u8(u8::from(*hash_alg));
                    write_opaque(buf, FieldWidth::U8, hash)?;
                }
                SignerIdentity::None => {}
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Decode from the front of `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let identity_type = read_u8(buf)?;
        let mut value = read_field(buf, FieldWidth::U16)?;
        let identity = match identity_type {
            1 | 2 => {
                let hash_alg = HashAlgorithm::from(read_u8(&mut value)?);
                let hash = read_field(&mut value, FieldWidth::U8)?;
                if identity_type == 1 {
                    SignerIdentity::CertHash { hash_alg, hash }
                } else {
                    SignerIdentity::CertHashNodeId { hash_alg, hash }
                }
            }
            3 => SignerIdentity::None,
            other => return Err(WireError::IdentityType(other)),
        };
        expect_drained(&value)?;
        Ok(identity)
    }
}

/// Signature over a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Hash algorithm
    pub hash_alg: HashAlgorithm,
    /// Signature algorithm
    pub sig_alg: SignatureAlgorithm,
    /// Who signed
    pub identity: SignerIdentity,
    /// Signature value
    pub value: Bytes,
}

impl Signature {
    /// Signature of an unsigned message
    pub fn none() -> Self {
        Self {
            hash_alg: HashAlgorithm::None,
            sig_alg: SignatureAlgorithm::Anonymous,
            identity: SignerIdentity::None,
            value: Bytes::new(),
        }
    }
}

/// Certificates plus signature trailing each message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityBlock {
    /// Certificate chain
    pub certificates: Vec<GenericCertificate>,
    /// Signature
    pub signature: Signature,
}

impl SecurityBlock {
    /// Security block of an unsigned message
    pub fn unsigned() -> Self {
        Self {
            certificates: Vec::new(),
            signature: Signature::none(),
        }
    }
}

impl Default for SecurityBlock {
    fn default() -> Self {
        Self::unsigned()
    }
}

/// Bytes covered by a signature
pub fn signature_input(
    overlay_hash: u32,
    transaction_id: u64,
    raw_content: &[u8],
    identity: &SignerIdentity,
) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::with_capacity(12 + raw_content.len() + 8);
    buf.put_u32(overlay_hash);
    buf.put_u64(transaction_id);
    buf.put_slice(raw_content);
    identity.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Codec for [`SecurityBlock`]
#[derive(Debug, Clone, Default)]
pub struct SecurityBlockCodec;

impl Codec for SecurityBlockCodec {
    type Item = SecurityBlock;

    fn encode(&self, block: &SecurityBlock, buf: &mut BytesMut) -> Result<(), WireError> {
        write_field(buf, FieldWidth::U16, |buf| {
            for cert in &block.certificates {
                buf.put_u8(u8::from(cert.cert_type));
                write_opaque(buf, FieldWidth::U16, &cert.certificate)?;
            }
            Ok(())
        })?;
        let sig = &block.signature;
        buf.put_u8(u8::from(sig.hash_alg));
        buf.put_u8(u8::from(sig.sig_alg));
        sig.identity.encode(buf)?;
        write_opaque(buf, FieldWidth::U16, &sig.value)
    }

    fn decode(&self, buf: &mut Bytes) -> Result<SecurityBlock, WireError> {
        let mut certs = read_field(buf, FieldWidth::U16)?;
        let mut certificates = Vec::new();
        while !certs.is_empty() {
            let cert_type = CertificateType::from(read_u8(&mut certs)?);
            let certificate = read_field(&mut certs, FieldWidth::U16)?;
            certificates.push(GenericCertificate {
                cert_type,
                certificate,
            });
        }

        let hash_alg = HashAlgorithm::from(read_u8(buf)?);
        let sig_alg = SignatureAlgorithm::from(read_u8(buf)?);
        let identity = SignerIdentity::decode(buf)?;
        let value = read_field(buf, FieldWidth::U16)?;

        Ok(SecurityBlock {
            certificates,
            signature: Signature {
                hash_alg,
                sig_alg,
                identity,
                value,
            },
        })
    }
}

impl RegisteredCodec for SecurityBlockCodec {
    fn build(_registry: &CodecRegistry) -> Self {
        SecurityBlockCodec
    }
}

/// Signature failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// Signature does not match the signed bytes
    #[error("bad signature")]
    BadSignature,

    /// Signer identity is not acceptable
    #[error("untrusted signer identity")]
    UntrustedIdentity,

    /// Signing failed
    #[error("signing failed: {0}")]
    Signing(String),

    /// Signed bytes could not be assembled
    #[error("wire: {0}")]
    Wire(#[from] WireError),
}

/// Signs outgoing and verifies incoming messages
pub trait Signer: Send + Sync {
    /// Identity placed in the signature
    fn identity(&self) -> SignerIdentity;

    /// Certificates placed in the security block
    fn certificates(&self) -> Vec<GenericCertificate> {
        Vec::new()
    }

    /// Hash algorithm used
    fn hash_algorithm(&self) -> HashAlgorithm;

    /// Signature algorithm used
    fn signature_algorithm(&self) -> SignatureAlgorithm;

    /// Sign `data`
    fn sign(&self, data: &[u8]) -> Result<Bytes, SecurityError>;

    /// Verify `signature` over `data` by `identity`
    fn verify(
        &self,
        identity: &SignerIdentity,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), SecurityError>;

    /// Build the security block for a message with the given signed fields
    fn security_block(
        &self,
        overlay_hash: u32,
        transaction_id: u64,
        raw_content: &[u8],
    ) -> Result<SecurityBlock, SecurityError> {
        let identity = self.identity();
        let input = signature_input(overlay_hash, transaction_id, raw_content, &identity)?;
        let value = self.sign(&input)?;
        Ok(SecurityBlock {
            certificates: self.certificates(),
            signature: Signature {
                hash_alg: self.hash_algorithm(),
                sig_alg: self.signature_algorithm(),
                identity,
                value,
            },
        })
    }

    /// Check the security block of a received message
    fn verify_block(
        &self,
        overlay_hash: u32,
        transaction_id: u64,
        raw_content: &[u8],
        block: &SecurityBlock,
    ) -> Result<(), SecurityError> {
        let sig = &block.signature;
        let input = signature_input(overlay_hash, transaction_id, raw_content, &sig.identity)?;
        self.verify(&sig.identity, &input, &sig.value)
    }
}

/// Signer for unauthenticated overlays: empty signatures, identity `none`
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSigner;

impl Signer for NullSigner {
    fn identity(&self) -> SignerIdentity {
        SignerIdentity::None
    }

    fn hash_algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::None
    }

    fn signature_algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Anonymous
    }

    fn sign(&self, _data: &[u8]) -> Result<Bytes, SecurityError> {
        Ok(Bytes::new())
    }

    fn verify(
        &self,
        identity: &SignerIdentity,
        _data: &[u8],
        signature: &[u8],
    ) -> Result<(), SecurityError> {
        if *identity != SignerIdentity::None {
            return Err(SecurityError::UntrustedIdentity);
        }
        if !signature.is_empty() {
            return Err(SecurityError::BadSignature);
        }
        Ok(())
    }
}

/// Integrity-only signer: the signature is a SHA-256 digest of the signed
/// bytes, the identity a hash of the node's certificate stand-in.
#[derive(Debug, Clone)]
pub struct DigestSigner {
    cert_hash: Bytes,
}

impl DigestSigner {
    /// Signer identified by the SHA-256 of `certificate`
    pub fn new(certificate: &[u8]) -> Self {
        Self {
            cert_hash: Bytes::copy_from_slice(&Sha256::digest(certificate)),
        }
    }
}

impl Signer for DigestSigner {
    fn identity(&self) -> SignerIdentity {
        SignerIdentity::CertHash {
            hash_alg: HashAlgorithm::Sha256,
            hash: self.cert_hash.clone(),
        }
    }

    fn hash_algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::Sha256
    }

    fn signature_algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Anonymous
    }

    fn sign(&self, data: &[u8]) -> Result<Bytes, SecurityError> {
        Ok(Bytes::copy_from_slice(&Sha256::digest(data)))
    }

    fn verify(
        &self,
        identity: &SignerIdentity,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), SecurityError> {
        if !matches!(identity, SignerIdentity::CertHash { hash_alg: HashAlgorithm::Sha256, .. }) {
            return Err(SecurityError::UntrustedIdentity);
        }
        if Sha256::digest(data).as_slice() != signature {
            return Err(SecurityError::BadSignature);
        }
        Ok(())
    }
}
