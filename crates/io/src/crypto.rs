//! Password protection for the binary container.
//!
//! An encrypted workbook is a compound file with two streams:
//!
//! - `EncryptionInfo`: magic, version, spin count, 16-byte salt, the
//!   encrypted password verifier and its encrypted SHA-512 hash, and an
//!   HMAC-SHA512 over the `EncryptedPackage` stream.
//! - `EncryptedPackage`: u64 plaintext length followed by the AES-256-CBC
//!   ciphertext of the plain binary container (zero padded to the block size).
//!
//! Keys come from the iterated password hash
//! `H0 = SHA512(salt || UTF-16LE(password))`, `Hn = SHA512(LE32(n) || Hn-1)`,
//! with a distinct block key mixed in for each purpose.

use aes::Aes256;
use cbc::{Decryptor, Encryptor};
use cellbook_config::EncryptionOptions;
use cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::binary::{read_stream, write_compound};
use crate::error::{IoError, Result};
use crate::format::CFB_SIGNATURE;

pub const INFO_STREAM: &str = "/EncryptionInfo";
pub const PACKAGE_STREAM: &str = "/EncryptedPackage";

const MAGIC: &[u8; 4] = b"CBKE";
const VERSION: u16 = 1;
const SALT_LEN: usize = 16;
const BLOCK: usize = 16;
const DIGEST_LEN: usize = 64;
/// Upper bound accepted when reading; larger values are treated as corruption
const MAX_SPIN_COUNT: u32 = 10_000_000;

const VERIFIER_INPUT_BLOCK: [u8; 8] = [0xfe, 0xa7, 0xd2, 0x76, 0x3b, 0x4b, 0x9e, 0x79];
const VERIFIER_HASH_BLOCK: [u8; 8] = [0xd7, 0xaa, 0x0f, 0x6d, 0x30, 0x61, 0x34, 0x4e];
const PACKAGE_KEY_BLOCK: [u8; 8] = [0x14, 0x6e, 0x0b, 0xe7, 0xab, 0xac, 0xd0, 0xd6];
const INTEGRITY_KEY_BLOCK: [u8; 8] = [0x5f, 0xb2, 0xad, 0x01, 0x0c, 0xb9, 0xe1, 0xf6];

type HmacSha512 = Hmac<Sha512>;

/// Parsed `EncryptionInfo` stream
struct EncryptionInfo {
    spin_count: u32,
    salt: [u8; SALT_LEN],
    verifier_input: [u8; BLOCK],
    verifier_hash: [u8; DIGEST_LEN],
    hmac: [u8; DIGEST_LEN],
}

impl EncryptionInfo {
    const LEN: usize = 4 + 2 + 4 + SALT_LEN + BLOCK + DIGEST_LEN + DIGEST_LEN;

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&self.spin_count.to_le_bytes());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.verifier_input);
        out.extend_from_slice(&self.verifier_hash);
        out.extend_from_slice(&self.hmac);
        out
    }

    fn parse(data: &[u8]) -> Result<Self> {
        if !data.starts_with(MAGIC) {
            return Err(IoError::UnsupportedFormat("unknown encryption scheme".into()));
        }
        if data.len() < Self::LEN {
            return Err(IoError::corrupt("EncryptionInfo is truncated"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != VERSION {
            return Err(IoError::UnsupportedFormat(format!("encryption version {}", version)));
        }
        let spin_count = u32::from_le_bytes([data[6], data[7], data[8], data[9]]);
        if spin_count > MAX_SPIN_COUNT {
            return Err(IoError::corrupt(format!("spin count {} is out of range", spin_count)));
        }

        let mut pos = 10;
        let mut take = |n: usize| {
            let slice = &data[pos..pos + n];
            pos += n;
            slice
        };
        let mut info = EncryptionInfo {
            spin_count,
            salt: [0; SALT_LEN],
            verifier_input: [0; BLOCK],
            verifier_hash: [0; DIGEST_LEN],
            hmac: [0; DIGEST_LEN],
        };
        info.salt.copy_from_slice(take(SALT_LEN));
        info.verifier_input.copy_from_slice(take(BLOCK));
        info.verifier_hash.copy_from_slice(take(DIGEST_LEN));
        info.hmac.copy_from_slice(take(DIGEST_LEN));
        Ok(info)
    }
}

/// True for a compound file carrying an `EncryptionInfo` stream
pub fn is_encrypted(bytes: &[u8]) -> bool {
    if !bytes.starts_with(&CFB_SIGNATURE) {
        return false;
    }
    cfb::CompoundFile::open(std::io::Cursor::new(bytes))
        .map(|comp| comp.is_stream(INFO_STREAM))
        .unwrap_or(false)
}

/// Wrap a plain binary container in password protection
pub fn encrypt(container: &[u8], password: &str, options: &EncryptionOptions) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut verifier = Zeroizing::new([0u8; BLOCK]);
    OsRng.fill_bytes(&mut verifier[..]);

    let hash = iterated_hash(password, &salt, options.spin_count);

    let mut verifier_input = *verifier;
    encrypt_in_place(&block_key(&hash, &VERIFIER_INPUT_BLOCK)[..], &salt, &mut verifier_input)?;
    let mut verifier_hash = [0u8; DIGEST_LEN];
    verifier_hash.copy_from_slice(&Sha512::digest(&verifier[..]));
    encrypt_in_place(&block_key(&hash, &VERIFIER_HASH_BLOCK)[..], &salt, &mut verifier_hash)?;

    let mut package = Vec::with_capacity(8 + container.len() + BLOCK);
    package.extend_from_slice(&(container.len() as u64).to_le_bytes());
    let mut body = Zeroizing::new(container.to_vec());
    let padded = body.len().div_ceil(BLOCK) * BLOCK;
    body.resize(padded, 0);
    encrypt_in_place(&block_key(&hash, &PACKAGE_KEY_BLOCK)[..], &package_iv(&salt), &mut body)?;
    package.extend_from_slice(&body);

    let info = EncryptionInfo {
        spin_count: options.spin_count,
        salt,
        verifier_input,
        verifier_hash,
        hmac: integrity(&hash, &package)?,
    };
    debug!("encrypted {} bytes (spin count {})", container.len(), options.spin_count);
    write_compound(&[(INFO_STREAM, &info.to_bytes()), (PACKAGE_STREAM, &package)])
}

/// Recover the plain binary container. A wrong password fails with
/// `WrongPassword`; a package that does not match its HMAC with `CorruptFile`.
pub fn decrypt(bytes: &[u8], password: &str) -> Result<Vec<u8>> {
    let info = EncryptionInfo::parse(&read_stream(bytes, INFO_STREAM)?)?;
    let package = read_stream(bytes, PACKAGE_STREAM)?;
    let hash = iterated_hash(password, &info.salt, info.spin_count);

    let mut input = Zeroizing::new(info.verifier_input);
    decrypt_in_place(&block_key(&hash, &VERIFIER_INPUT_BLOCK)[..], &info.salt, &mut input[..])?;
    let mut expected = Zeroizing::new(info.verifier_hash);
    decrypt_in_place(&block_key(&hash, &VERIFIER_HASH_BLOCK)[..], &info.salt, &mut expected[..])?;
    let actual = Sha512::digest(&input[..]);
    if !bool::from(actual.as_slice().ct_eq(&expected[..])) {
        return Err(IoError::WrongPassword);
    }

    let mut mac = integrity_mac(&hash)?;
    mac.update(&package);
    mac.verify_slice(&info.hmac)
        .map_err(|_| IoError::corrupt("encrypted package failed its integrity check"))?;

    if package.len() < 8 || (package.len() - 8) % BLOCK != 0 {
        return Err(IoError::corrupt("encrypted package has an invalid length"));
    }
    let mut size = [0u8; 8];
    size.copy_from_slice(&package[..8]);
    let size = u64::from_le_bytes(size) as usize;
    let mut body = package[8..].to_vec();
    if size > body.len() {
        return Err(IoError::corrupt("encrypted package is shorter than its declared size"));
    }
    decrypt_in_place(&block_key(&hash, &PACKAGE_KEY_BLOCK)[..], &package_iv(&info.salt), &mut body)?;
    body.truncate(size);
    Ok(body)
}

fn iterated_hash(password: &str, salt: &[u8], spin_count: u32) -> Zeroizing<Vec<u8>> {
    let password: Zeroizing<Vec<u8>> =
        Zeroizing::new(password.encode_utf16().flat_map(|u| u.to_le_bytes()).collect());

    let mut h = Zeroizing::new(vec![0u8; DIGEST_LEN]);
    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(&password[..]);
    h.copy_from_slice(&hasher.finalize());

    let mut round = Zeroizing::new(vec![0u8; 4 + DIGEST_LEN]);
    for i in 0..spin_count {
        round[..4].copy_from_slice(&i.to_le_bytes());
        round[4..].copy_from_slice(&h);
        h.copy_from_slice(&Sha512::digest(&round[..]));
    }
    h
}

/// 256-bit key for one purpose
fn block_key(hash: &[u8], block: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha512::new();
    hasher.update(hash);
    hasher.update(block);
    let digest = hasher.finalize();
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&digest[..32]);
    key
}

fn package_iv(salt: &[u8]) -> [u8; BLOCK] {
    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(PACKAGE_KEY_BLOCK);
    let mut iv = [0u8; BLOCK];
    iv.copy_from_slice(&hasher.finalize()[..BLOCK]);
    iv
}

fn integrity_mac(hash: &[u8]) -> Result<HmacSha512> {
    let mut hasher = Sha512::new();
    hasher.update(hash);
    hasher.update(INTEGRITY_KEY_BLOCK);
    let key = Zeroizing::new(hasher.finalize().to_vec());
    <HmacSha512 as Mac>::new_from_slice(&key).map_err(|_| IoError::encode("invalid HMAC key"))
}

fn integrity(hash: &[u8], package: &[u8]) -> Result<[u8; DIGEST_LEN]> {
    let mut mac = integrity_mac(hash)?;
    mac.update(package);
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn encrypt_in_place(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
    let len = buf.len();
    Encryptor::<Aes256>::new_from_slices(key, iv)
        .map_err(|_| IoError::encode("invalid key length"))?
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| IoError::encode("plaintext is not block aligned"))?;
    Ok(())
}

fn decrypt_in_place(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
    Decryptor::<Aes256>::new_from_slices(key, iv)
        .map_err(|_| IoError::corrupt("invalid key length"))?
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| IoError::corrupt("ciphertext is not block aligned"))?;
    Ok(())
}
