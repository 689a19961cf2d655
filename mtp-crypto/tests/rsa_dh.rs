use mtp_crypto::dh::{self, DhError};
use mtp_crypto::rsa::{self, PublicKey};
use mtp_crypto::{AuthKey, factorize, generate_key_data_from_nonce, sha1};
use num_bigint::BigUint;

const N: &str = "24380471222966417672426490418254708545418837607748784314120388960170496524379314496023130763982936780968261774363805061547334242618488461786780737422931789829014947619808945294559267516759717513130360017069191028675397414326351693802270926424573062125944003119195732071437664165089956253217600334297359984269103842137782325894972980107967256553564821997368938862932928728954898064115596561267032961971255658716474899664092899975565312271385973697080560510119672567484880038922437458150505171427906023069295883130026945211229806491412022772033545820248538350358247430649769852752211298604508742824865552382635965590389";
const D: &str = "1621037022660118177633984344683841074304020398794045007381778154232615753009488730280922109709868425821584764053744915935921829839786128022886263687999531168346623041233463221097120835623853228915964169467308541853503276514443406102558792161604545801818835064038564513195441072972206301377781916424321316682961611669724245262835949936523236011697642858671910953797554717049800987494835124208955281807538843936359523555275254939822290105100169948413437148143277310255539113161444792477253348180562879945165711932100922435645097810621774142200479014459114781917393881273252326088948175080489843939073359919648326664323";

fn decimal(s: &str) -> BigUint {
    BigUint::parse_bytes(s.as_bytes(), 10).unwrap()
}

// ── RSA ───────────────────────────────────────────────────────────────────────

#[test]
fn hashed_block_decrypts_with_private_exponent() {
    let key = PublicKey::new(N, "65537").unwrap();
    assert_eq!(key.fingerprint(), -5497770012879854190);

    let data: Vec<u8> = (0..96u8).collect();
    let random = [0xa5u8; rsa::BLOCK_LEN - 1];
    let cipher = key.encrypt_hashed(&data, &random).unwrap();

    let plain = BigUint::from_bytes_be(&cipher).modpow(&decimal(D), key.modulus()).to_bytes_be();
    // Leading zero byte disappears in the big-endian integer.
    assert_eq!(plain.len(), rsa::BLOCK_LEN - 1);
    assert_eq!(&plain[..20], &sha1!(&data));
    assert_eq!(&plain[20..116], &data[..]);
    assert!(plain[116..].iter().all(|&b| b == 0xa5));
}

#[test]
fn server_picks_our_injected_key() {
    let ours = PublicKey::new(N, "65537").unwrap();
    let mut keys = rsa::builtin_keys(false);
    keys.push(ours.clone());
    let picked = rsa::find_by_fingerprint(&keys, &[42, ours.fingerprint()]).unwrap();
    assert_eq!(picked, &ours);
}

// ── PQ ────────────────────────────────────────────────────────────────────────

#[test]
fn factorizes_server_pq() {
    assert_eq!(factorize(0x17ED48941A08F981), Some((0x494C553B, 0x53911073)));
    assert_eq!(factorize(1000003), None);
}

// ── DH ────────────────────────────────────────────────────────────────────────

#[test]
fn shared_key_from_both_sides_matches() {
    let p = BigUint::parse_bytes(dh::KNOWN_GOOD_PRIME.as_bytes(), 16).unwrap();
    let g = BigUint::from(3u32);
    dh::check_prime_and_generator(&p, 3).unwrap();

    let a = BigUint::from_bytes_be(&[0x5a; 256]);
    let b = BigUint::from_bytes_be(&[0x3c; 256]);
    let g_a = g.modpow(&a, &p);
    let g_b = g.modpow(&b, &p);
    dh::check_public_value(&g_a, &p).unwrap();
    dh::check_public_value(&g_b, &p).unwrap();

    let client = g_a.modpow(&b, &p);
    let server = g_b.modpow(&a, &p);
    assert_eq!(client, server);

    let mut data = [0u8; 256];
    let bytes = client.to_bytes_be();
    data[256 - bytes.len()..].copy_from_slice(&bytes);
    let key = AuthKey::from_bytes(data);
    assert_eq!(hex::encode(key.key_id()), "d0b862e8e06397fa");
    assert_eq!(key.id(), 18057011048587901136);
}

#[test]
fn out_of_range_public_value_is_refused() {
    let p = BigUint::parse_bytes(dh::KNOWN_GOOD_PRIME.as_bytes(), 16).unwrap();
    assert_eq!(dh::check_public_value(&BigUint::from(2u32), &p), Err(DhError::ValueOutOfRange));
}

#[test]
fn nonce_key_data_is_deterministic() {
    let server_nonce: [u8; 16] = std::array::from_fn(|i| 16 + i as u8);
    let new_nonce: [u8; 32] = std::array::from_fn(|i| 32 + i as u8);
    let (k1, iv1) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
    let (k2, iv2) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
    assert_eq!((k1, iv1), (k2, iv2));
    assert_eq!(&iv1[28..], &new_nonce[..4]);
    assert_eq!(&k1[..20], &sha1!(&new_nonce, &server_nonce));
}
