/// Inputs are capped so a single case cannot exhaust memory.
pub const MAX_INPUT_SIZE: usize = 256 * 1024;

#[inline]
pub fn truncate(data: &[u8]) -> &[u8] {
    &data[..data.len().min(MAX_INPUT_SIZE)]
}
