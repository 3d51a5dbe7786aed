use bytes::Bytes;
use ecdsa::signature::Verifier as _;
use crate::codec::Buffer;
use crate::error::{Result, Error};
use super::{PubkeyAlgo, Pubkey, SignatureVerified};

/// "ecdsa-sha2-nistp256" public key algorithm from RFC 5656.
pub static ECDSA_SHA2_NISTP256: PubkeyAlgo = PubkeyAlgo {
    name: "ecdsa-sha2-nistp256",
    verify: verify_p256,
};

/// "ecdsa-sha2-nistp384" public key algorithm from RFC 5656.
pub static ECDSA_SHA2_NISTP384: PubkeyAlgo = PubkeyAlgo {
    name: "ecdsa-sha2-nistp384",
    verify: verify_p384,
};

/// ECDSA public key on the NIST P-256 curve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdsaP256Pubkey {
    pub(crate) verifying: p256::ecdsa::VerifyingKey,
    point: Bytes,
}

/// ECDSA public key on the NIST P-384 curve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdsaP384Pubkey {
    pub(crate) verifying: p384::ecdsa::VerifyingKey,
    point: Bytes,
}

// RFC 5656, section 3.1.2
fn decode_scalars<const N: usize>(signature: &mut Buffer) -> Result<([u8; N], [u8; N])> {
    let mut blob = Buffer::from(signature.get_bytes()?);
    let r = mpint_to_fixed::<N>(&blob.get_bytes()?)?;
    let s = mpint_to_fixed::<N>(&blob.get_bytes()?)?;
    Ok((r, s))
}

fn mpint_to_fixed<const N: usize>(mpint: &[u8]) -> Result<[u8; N]> {
    let first_nonzero = mpint.iter().position(|&b| b != 0).unwrap_or(mpint.len());
    let value = &mpint[first_nonzero..];
    if value.len() > N {
        return Err(Error::Signature)
    }
    let mut fixed = [0; N];
    fixed[N - value.len()..].copy_from_slice(value);
    Ok(fixed)
}

fn verify_p256(pubkey: &Pubkey, message: &[u8], signature: Bytes) -> Result<SignatureVerified> {
    let Pubkey::EcdsaP256(pubkey) = pubkey else { return Err(Error::Signature) };
    let mut signature = super::decode_signature(signature, "ecdsa-sha2-nistp256")?;
    let (r, s) = decode_scalars::<32>(&mut signature)?;
    let ec_signature = p256::ecdsa::Signature::from_scalars(
        p256::FieldBytes::clone_from_slice(&r), p256::FieldBytes::clone_from_slice(&s))
        .map_err(|_| Error::Signature)?;
    match pubkey.verifying.verify(message, &ec_signature) {
        Ok(_) => Ok(SignatureVerified::assertion()),
        Err(_) => Err(Error::Signature),
    }
}

fn verify_p384(pubkey: &Pubkey, message: &[u8], signature: Bytes) -> Result<SignatureVerified> {
    let Pubkey::EcdsaP384(pubkey) = pubkey else { return Err(Error::Signature) };
    let mut signature = super::decode_signature(signature, "ecdsa-sha2-nistp384")?;
    let (r, s) = decode_scalars::<48>(&mut signature)?;
    let ec_signature = p384::ecdsa::Signature::from_scalars(
        p384::FieldBytes::clone_from_slice(&r), p384::FieldBytes::clone_from_slice(&s))
        .map_err(|_| Error::Signature)?;
    match pubkey.verifying.verify(message, &ec_signature) {
        Ok(_) => Ok(SignatureVerified::assertion()),
        Err(_) => Err(Error::Signature),
    }
}

fn decode_point(blob: &mut Buffer, curve_name: &str) -> Result<Bytes> {
    if blob.get_string()? != curve_name {
        return Err(Error::Protocol("ecdsa public key has unexpected curve identifier"))
    }
    blob.get_bytes()
}

pub(super) fn decode_p256(blob: &mut Buffer) -> Result<EcdsaP256Pubkey> {
    let point = decode_point(blob, "nistp256")?;
    let verifying = p256::ecdsa::VerifyingKey::from_sec1_bytes(&point)
        .map_err(|_| Error::Crypto("ecdsa public key is not valid"))?;
    Ok(EcdsaP256Pubkey { verifying, point })
}

pub(super) fn decode_p384(blob: &mut Buffer) -> Result<EcdsaP384Pubkey> {
    let point = decode_point(blob, "nistp384")?;
    let verifying = p384::ecdsa::VerifyingKey::from_sec1_bytes(&point)
        .map_err(|_| Error::Crypto("ecdsa public key is not valid"))?;
    Ok(EcdsaP384Pubkey { verifying, point })
}

pub(super) fn encode_p256(blob: &mut Buffer, pubkey: &EcdsaP256Pubkey) {
    blob.put_str("ecdsa-sha2-nistp256");
    blob.put_str("nistp256");
    blob.put_bytes(&pubkey.point);
}

pub(super) fn encode_p384(blob: &mut Buffer, pubkey: &EcdsaP384Pubkey) {
    blob.put_str("ecdsa-sha2-nistp384");
    blob.put_str("nistp384");
    blob.put_bytes(&pubkey.point);
}
