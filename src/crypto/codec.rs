//! Embedding vectors sealed for storage.
//!
//! A vector is serialised as little-endian `f32`s and sealed with AES-256-GCM under a fresh
//! nonce, giving `nonce(12) ‖ ciphertext(4·dim) ‖ tag(16)`. Length therefore depends only on
//! the dimension.

use aes_gcm::Aes256Gcm;

use super::cipher::{CryptoError, NONCE_LEN, SecretKey, TAG_LEN, open_with, seal_with};

const FLOAT_LEN: usize = std::mem::size_of::<f32>();

/// Encrypting vector serializer bound to one tenant key.
pub struct VectorCodec {
    cipher: Aes256Gcm,
}

impl VectorCodec {
    /// Codec for `key`. The cipher is built once and reused for every vector.
    pub fn new(key: &SecretKey) -> Self {
        Self {
            cipher: key.cipher(),
        }
    }

    /// Sealed size of a vector with `dimension` components.
    pub const fn ciphertext_len(dimension: usize) -> usize {
        NONCE_LEN + FLOAT_LEN * dimension + TAG_LEN
    }

    /// Seal one vector.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>, CryptoError> {
        if let Some(position) = vector.iter().position(|value| !value.is_finite()) {
            return Err(CryptoError::Malformed(format!(
                "component {position} is not finite"
            )));
        }
        let mut plain = Vec::with_capacity(FLOAT_LEN * vector.len());
        for value in vector {
            plain.extend_from_slice(&value.to_le_bytes());
        }
        seal_with(&self.cipher, &plain, &[])
    }

    /// Open one vector; fails closed on a wrong key or tampering.
    pub fn decode(&self, ciphertext: &[u8]) -> Result<Vec<f32>, CryptoError> {
        let overhead = NONCE_LEN + TAG_LEN;
        if ciphertext.len() < overhead || (ciphertext.len() - overhead) % FLOAT_LEN != 0 {
            return Err(CryptoError::Malformed(format!(
                "{} bytes is not a valid sealed vector length",
                ciphertext.len()
            )));
        }
        let plain = open_with(&self.cipher, ciphertext, &[])?;
        Ok(plain
            .chunks_exact(FLOAT_LEN)
            .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect())
    }

    /// Seal many vectors with the same cipher instance; each still gets its own nonce.
    pub fn encode_batch(&self, vectors: &[Vec<f32>]) -> Result<Vec<Vec<u8>>, CryptoError> {
        vectors.iter().map(|vector| self.encode(vector)).collect()
    }

    /// Open many vectors; the first failure aborts the batch.
    pub fn decode_batch(&self, ciphertexts: &[Vec<u8>]) -> Result<Vec<Vec<f32>>, CryptoError> {
        ciphertexts.iter().map(|blob| self.decode(blob)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dimension: usize) -> Vec<f32> {
        (0..dimension).map(|i| (i as f32 * 0.37).sin()).collect()
    }

    #[test]
    fn round_trip_preserves_values_exactly() {
        let codec = VectorCodec::new(&SecretKey::generate());
        let vector = sample(768);
        let sealed = codec.encode(&vector).unwrap();
        assert_eq!(sealed.len(), VectorCodec::ciphertext_len(768));
        assert_eq!(codec.decode(&sealed).unwrap(), vector);
    }

    #[test]
    fn ciphertext_length_depends_only_on_dimension() {
        let codec = VectorCodec::new(&SecretKey::generate());
        let a = codec.encode(&[0.0; 16]).unwrap();
        let b = codec.encode(&[123.5; 16]).unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(a.len(), 12 + 64 + 16);
    }

    #[test]
    fn another_tenants_key_fails_closed() {
        let tenant_a = VectorCodec::new(&SecretKey::generate());
        let tenant_b = VectorCodec::new(&SecretKey::generate());
        let sealed = tenant_a.encode(&sample(8)).unwrap();
        assert!(matches!(
            tenant_b.decode(&sealed),
            Err(CryptoError::Decryption(_))
        ));
    }

    #[test]
    fn malformed_lengths_are_rejected_before_decryption() {
        let codec = VectorCodec::new(&SecretKey::generate());
        let mut sealed = codec.encode(&sample(4)).unwrap();
        sealed.push(0);
        assert!(matches!(codec.decode(&sealed), Err(CryptoError::Malformed(_))));
        assert!(matches!(codec.decode(&[0; 8]), Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn non_finite_components_are_rejected() {
        let codec = VectorCodec::new(&SecretKey::generate());
        assert!(codec.encode(&[1.0, f32::NAN]).is_err());
        assert!(codec.encode(&[f32::INFINITY]).is_err());
    }

    #[test]
    fn batches_use_distinct_nonces() {
        let codec = VectorCodec::new(&SecretKey::generate());
        let vectors = vec![sample(4), sample(4)];
        let sealed = codec.encode_batch(&vectors).unwrap();
        assert_ne!(sealed[0], sealed[1]);
        assert_eq!(codec.decode_batch(&sealed).unwrap(), vectors);
    }

    #[test]
    fn empty_vector_round_trips() {
        let codec = VectorCodec::new(&SecretKey::generate());
        let sealed = codec.encode(&[]).unwrap();
        assert_eq!(sealed.len(), VectorCodec::ciphertext_len(0));
        assert!(codec.decode(&sealed).unwrap().is_empty());
    }
}
