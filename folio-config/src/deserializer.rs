pub mod uppercase_key {
    use serde::de::{Deserialize, Deserializer};
    use std::collections::HashMap;

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<HashMap<String, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        let map = HashMap::<String, V>::deserialize(deserializer)?;
        Ok(map
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect())
    }
}
