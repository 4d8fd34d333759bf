/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use zeroize::Zeroize;

/// Fixed-size secret key material, zeroed on drop.
///
/// Debug/Display are deliberately not implemented so key bytes cannot leak
/// into logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret<const L: usize>(pub [u8; L]);

impl<const L: usize> Secret<L> {
    #[inline(always)]
    pub fn new() -> Self {
        Self([0_u8; L])
    }

    #[inline(always)]
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() == L {
            let mut tmp = [0_u8; L];
            tmp.copy_from_slice(b);
            Some(Self(tmp))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8; L] {
        &self.0
    }

    /// Copy of the first N bytes.
    #[inline(always)]
    pub fn first_n<const N: usize>(&self) -> [u8; N] {
        debug_assert!(N <= L);
        let mut tmp = [0_u8; N];
        tmp.copy_from_slice(&self.0[..N]);
        tmp
    }
}

impl<const L: usize> Default for Secret<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const L: usize> Drop for Secret<L> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<const L: usize> AsRef<[u8]> for Secret<L> {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_enforces_length() {
        assert!(Secret::<32>::from_bytes(&[0_u8; 32]).is_some());
        assert!(Secret::<32>::from_bytes(&[0_u8; 31]).is_none());
    }

    #[test]
    fn first_n_truncates() {
        let mut s = Secret::<8>::new();
        s.0.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(s.first_n::<4>(), [1, 2, 3, 4]);
    }
}
