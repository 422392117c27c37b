/// Fixed-width sample types that can live in a mirrored region.
///
/// # Safety
///
/// Every bit pattern must be a valid value of the type, its alignment must
/// not exceed its size, and its size must divide the page size. The region
/// starts zero-filled and the consumer may observe whatever the producer
/// wrote, so types with invalid bit patterns (`bool`, `char`, references)
/// must not implement this.
pub unsafe trait Element: Copy + Send + Sync + 'static {}

macro_rules! impl_element {
    ($($ty:ty),* $(,)?) => {
        $(unsafe impl Element for $ty {})*
    };
}

impl_element!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);
