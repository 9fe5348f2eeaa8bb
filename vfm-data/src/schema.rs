use serde::{Deserialize, Serialize};

/// Partition of `F` sparse features into disjoint groups.
///
/// Every feature belongs to exactly one group. The schema is fixed
/// once a model is built on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    group_of: Vec<usize>,
    group_names: Vec<Box<str>>,
}

impl FeatureSchema {
    /// Build a schema from the group id of each feature
    ///
    /// * `group_of` - group membership, one entry per feature
    /// * `group_names` - one name per group
    pub fn new(group_of: Vec<usize>, group_names: Vec<Box<str>>) -> anyhow::Result<Self> {
        if group_names.is_empty() {
            anyhow::bail!("need at least one feature group");
        }
        if let Some(&g) = group_of.iter().find(|&&g| g >= group_names.len()) {
            anyhow::bail!(
                "group id {} out of range for {} groups",
                g,
                group_names.len()
            );
        }
        Ok(Self {
            group_of,
            group_names,
        })
    }

    /// All `num_features` features in one group
    pub fn single_group(num_features: usize) -> Self {
        Self {
            group_of: vec![0; num_features],
            group_names: vec!["all".into()],
        }
    }

    /// One-hot user features first, then one-hot item features
    pub fn user_item(num_users: usize, num_items: usize) -> Self {
        let mut group_of = vec![0; num_users];
        group_of.extend(std::iter::repeat_n(1, num_items));
        Self {
            group_of,
            group_names: vec!["user".into(), "item".into()],
        }
    }

    /// Same features, grouping collapsed to a single group
    pub fn collapsed(&self) -> Self {
        Self::single_group(self.num_features())
    }

    pub fn num_features(&self) -> usize {
        self.group_of.len()
    }

    pub fn num_groups(&self) -> usize {
        self.group_names.len()
    }

    pub fn group_of(&self, feature: usize) -> Option<usize> {
        self.group_of.get(feature).copied()
    }

    pub fn groups(&self) -> &[usize] {
        &self.group_of
    }

    pub fn group_names(&self) -> &[Box<str>] {
        &self.group_names
    }

    /// Number of features in each group
    pub fn group_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.num_groups()];
        for &g in self.group_of.iter() {
            sizes[g] += 1;
        }
        sizes
    }
}

/// Index arithmetic for the one-hot user/item layout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserItemLayout {
    pub num_users: usize,
    pub num_items: usize,
}

impl UserItemLayout {
    pub fn new(num_users: usize, num_items: usize) -> Self {
        Self {
            num_users,
            num_items,
        }
    }

    pub fn num_features(&self) -> usize {
        self.num_users + self.num_items
    }

    /// Global feature index of user `u`
    pub fn user_feature(&self, u: usize) -> anyhow::Result<usize> {
        if u >= self.num_users {
            anyhow::bail!("user {} out of range ({} users)", u, self.num_users);
        }
        Ok(u)
    }

    /// Global feature index of item `i`
    pub fn item_feature(&self, i: usize) -> anyhow::Result<usize> {
        if i >= self.num_items {
            anyhow::bail!("item {} out of range ({} items)", i, self.num_items);
        }
        Ok(self.num_users + i)
    }

    pub fn schema(&self) -> FeatureSchema {
        FeatureSchema::user_item(self.num_users, self.num_items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_item_groups() {
        let schema = FeatureSchema::user_item(2, 3);
        assert_eq!(schema.num_features(), 5);
        assert_eq!(schema.num_groups(), 2);
        assert_eq!(schema.groups(), &[0, 0, 1, 1, 1]);
        assert_eq!(schema.group_sizes(), vec![2, 3]);
        assert_eq!(schema.collapsed().groups(), &[0; 5]);
    }

    #[test]
    fn rejects_unknown_group() {
        let res = FeatureSchema::new(vec![0, 2], vec!["a".into(), "b".into()]);
        assert!(res.is_err());
    }

    #[test]
    fn layout_indexes() -> anyhow::Result<()> {
        let layout = UserItemLayout::new(3, 4);
        assert_eq!(layout.user_feature(2)?, 2);
        assert_eq!(layout.item_feature(0)?, 3);
        assert!(layout.item_feature(4).is_err());
        Ok(())
    }
}
