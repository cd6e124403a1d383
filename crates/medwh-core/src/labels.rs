//! Closed label vocabularies assigned by the classification rules.
//!
//! Labels serialize as their display text, which is also what the materialized tables hold.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! label_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

label_enum!(
    /// Product family mentioned in a message's text.
    ProductCategory {
        Medication => "Medication",
        Supplements => "Supplements",
        MedicalEquipment => "Medical Equipment",
        Cosmetics => "Cosmetics",
        BabyCare => "Baby Care",
        Hygiene => "Hygiene",
        Other => "Other",
    }
);

label_enum!(ChannelType {
    Pharmaceutical => "Pharmaceutical",
    Cosmetics => "Cosmetics",
    Medical => "Medical",
    Other => "Other",
});

label_enum!(ActivityStatus {
    Active => "Active",
    RecentlyActive => "Recently Active",
    Inactive => "Inactive",
});

label_enum!(
    /// Short < 50 characters, Medium 50..=200, Long > 200.
    LengthCategory {
        Short => "Short",
        Medium => "Medium",
        Long => "Long",
    }
);

label_enum!(SceneComposition {
    PersonWithProduct => "Person with Product",
    PersonOnly => "Person Only",
    ProductOnly => "Product Only",
    NoPersonOrProduct => "No Person or Product",
});

label_enum!(DetectionQuality {
    NoDetection => "No Detection",
    Low => "Low Confidence",
    Medium => "Medium Confidence",
    High => "High Confidence",
});

label_enum!(ContentStrategy {
    PromotionalContent => "Promotional Content",
    ProductShowcase => "Product Showcase",
    LifestyleContent => "Lifestyle Content",
    OtherContent => "Other Content",
});
