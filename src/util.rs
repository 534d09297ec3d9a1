// Round up to the next multiple of a power of two alignment
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

// Macro to generate a plain counter struct with one field per enum variant,
// keeps per category statistics copyable without any map allocation
macro_rules! category_counters {
    ($(#[$meta:meta])* $vis:vis struct $name:ident for $category:ident {
        $( $variant:ident => $field:ident ),* $(,)?
    }) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        $vis struct $name {
            $( pub $field: u64, )*
        }

        impl $name {
            pub fn increment(&mut self, category: $category) {
                match category {
                    $( $category::$variant => self.$field += 1, )*
                }
            }

            pub fn get(&self, category: $category) -> u64 {
                match category {
                    $( $category::$variant => self.$field, )*
                }
            }

            pub fn total(&self) -> u64 {
                0 $( + self.$field )*
            }

            pub fn merge(&mut self, other: &$name) {
                $( self.$field += other.$field; )*
            }
        }
    };
}

pub(crate) use category_counters;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy)]
    enum Color {
        Red,
        Blue,
    }

    category_counters! {
        struct ColorCounters for Color {
            Red => red,
            Blue => blue,
        }
    }

    #[test]
    fn counters_track_each_variant() {
        let mut counters = ColorCounters::default();
        counters.increment(Color::Red);
        counters.increment(Color::Red);
        counters.increment(Color::Blue);
        assert_eq!(counters.get(Color::Red), 2);
        assert_eq!(counters.total(), 3);

        let mut sum = ColorCounters::default();
        sum.merge(&counters);
        sum.merge(&counters);
        assert_eq!(sum.blue, 2);
    }

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(256, 4), 256);
        assert_eq!(align_up(1601, 64), 1664);
    }
}
