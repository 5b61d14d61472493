//! Region name normalization.
//!
//! Statistics sources abbreviate region names ("恩施州", "广西") while the
//! boundary datasets key their polygons by the full administrative name
//! ("恩施土家族苗族自治州", "广西壮族自治区"). A [`NameNormalizer`] bridges the
//! two namespaces with a static alias table.

use std::collections::{HashMap, HashSet};

/// Generic suffix dropped from source names before alias lookup.
const GENERIC_SUFFIX: &str = "地区";

/// Provincial/municipal administrative suffixes stripped by callers.
const ADMIN_SUFFIXES: [&str; 2] = ["省", "市"];

/// City-level abbreviations mapped to the names used by the city boundary dataset.
const CITY_ALIASES: &[(&str, &str)] = &[
    ("乐东", "乐东黎族自治县"),
    ("伊犁州", "伊犁哈萨克自治州"),
    ("保亭", "保亭黎族苗族自治县"),
    ("六盘水", "六盘水市大湾镇"),
    ("凉山州", "凉山彝族自治州"),
    ("博尔塔拉", "博尔塔拉蒙古自治州"),
    ("巴音郭楞", "巴音郭楞蒙古自治州"),
    ("延边", "延边朝鲜族自治州"),
    ("恩施州", "恩施土家族苗族自治州"),
    ("昌吉州", "昌吉回族自治州"),
    ("昌江", "昌江黎族自治县"),
    ("海北州", "海北藏族自治州"),
    ("海南州", "海南藏族自治州"),
    ("湘西自治州", "湘西土家族苗族自治州"),
    ("玉树", "玉树藏族自治州"),
    ("琼中", "琼中黎族苗族自治县"),
    ("甘南", "甘南藏族自治州"),
    ("甘孜州", "甘孜藏族自治州"),
    ("阿坝州", "阿坝藏族羌族自治州"),
    ("陵水", "陵水黎族自治县"),
    ("黔东南州", "黔东南苗族侗族"),
    ("黔南州", "黔南布依族苗族"),
    ("黔西南州", "黔西南布依族苗族"),
    ("临夏", "临夏回族自治州"),
    ("临高", "临高县"),
    ("吐鲁番", "吐鲁番地区"),
    ("铜仁", "铜仁地区"),
    ("毕节", "毕节地区"),
    ("澄迈", "澄迈县"),
    ("巴州", "巴音郭楞蒙古自治州"),
];

/// Province-level short names mapped to the province boundary dataset's names.
const PROVINCE_ALIASES: &[(&str, &str)] = &[
    ("广西", "广西壮族自治区"),
    ("内蒙古", "内蒙古自治区"),
    ("宁夏", "宁夏回族自治区"),
    ("新疆", "新疆维吾尔自治区"),
    ("西藏", "西藏自治区"),
];

/// Maps source region names to canonical boundary-dataset names.
///
/// Pure and infallible: a name with no alias comes back unchanged (after
/// suffix stripping), and it is the caller's job to check it against a
/// [`crate::boundary::BoundaryDataset`].
#[derive(Debug, Clone, Default)]
pub struct NameNormalizer {
    aliases: HashMap<String, String>,
    exceptions: HashSet<String>,
}

impl NameNormalizer {
    /// Build a normalizer from an alias table and a set of names exempt from suffix stripping.
    pub fn new<A, E>(aliases: A, exceptions: E) -> Self
    where
        A: IntoIterator<Item = (String, String)>,
        E: IntoIterator<Item = String>,
    {
        Self {
            aliases: aliases.into_iter().collect(),
            exceptions: exceptions.into_iter().collect(),
        }
    }

    /// Normalizer for city-level names.
    pub fn cities() -> Self {
        Self::from_static(CITY_ALIASES)
    }

    /// Normalizer for province-level names.
    pub fn provinces() -> Self {
        Self::from_static(PROVINCE_ALIASES)
    }

    fn from_static(table: &[(&str, &str)]) -> Self {
        Self::new(
            table
                .iter()
                .map(|(short, full)| (short.to_string(), full.to_string())),
            std::iter::empty(),
        )
    }

    /// Add a name that keeps its generic suffix.
    pub fn with_exception(mut self, name: &str) -> Self {
        self.exceptions.insert(name.to_string());
        self
    }

    /// Resolve a raw source name to its canonical form.
    pub fn normalize(&self, raw_name: &str) -> String {
        let name = if self.exceptions.contains(raw_name) {
            raw_name
        } else {
            raw_name.strip_suffix(GENERIC_SUFFIX).unwrap_or(raw_name)
        };

        match self.aliases.get(name) {
            Some(canonical) => canonical.clone(),
            None => name.to_string(),
        }
    }
}

/// Strip one trailing provincial ("省") then municipal ("市") suffix.
///
/// "湖北省" becomes "湖北", "北京市" becomes "北京". Names that are nothing
/// but a suffix are returned as-is.
pub fn strip_admin_suffix(name: &str) -> &str {
    ADMIN_SUFFIXES.iter().fold(name, |acc, suffix| {
        match acc.strip_suffix(suffix) {
            Some(stripped) if !stripped.is_empty() => stripped,
            _ => acc,
        }
    })
}
