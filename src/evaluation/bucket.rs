use md5::{Digest, Md5};

/// Map a user identifier onto a bucket in `[0, 100)`.
///
/// The bucket is the first four bytes of the MD5 digest of the id, read
/// big-endian, modulo 100. Changing any part of this reshuffles every user
/// that has no stored assignment yet.
pub fn bucket(user_id: &str) -> u32 {
    let digest = Md5::digest(user_id.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % 100
}

/// Consistent hashing for percentage rollout
/// Ensures the same user always gets the same result for a given percentage
pub fn in_rollout(user_id: &str, percentage: i32) -> bool {
    if percentage >= 100 {
        return true;
    }
    if percentage <= 0 {
        return false;
    }

    (bucket(user_id) as i32) < percentage
}
