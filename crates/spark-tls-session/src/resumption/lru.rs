use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
};

/// 固定容量、按最近使用排序的缓存。
///
/// `order` 以单调递增的访问序号为键；最小序号即最久未使用的条目。
/// 过期判断交给调用方，本结构只负责容量与顺序。
#[derive(Debug)]
pub(crate) struct BoundedCache<K, V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
}

#[derive(Debug)]
struct Slot<V> {
    value: V,
    tick: u64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// 取可变引用并标记为最近使用。
    pub(crate) fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let tick = self.next_tick();
        let slot = self.entries.get_mut(key)?;
        self.order.remove(&slot.tick);
        slot.tick = tick;
        self.order.insert(tick, key.clone());
        Some(&mut slot.value)
    }

    pub(crate) fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// 插入或替换；容量已满时淘汰最久未使用的条目并返回之。
    pub(crate) fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let tick = self.next_tick();
        if let Some(previous) = self.entries.insert(key.clone(), Slot { value, tick }) {
            self.order.remove(&previous.tick);
            self.order.insert(tick, key);
            return None;
        }
        self.order.insert(tick, key);
        if self.entries.len() <= self.capacity {
            return None;
        }
        let (_, oldest) = self.order.pop_first()?;
        self.entries
            .remove(&oldest)
            .map(|slot| (oldest, slot.value))
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.tick);
        Some(slot.value)
    }

    /// 删除满足条件的条目，返回删除数量。
    pub(crate) fn remove_where(&mut self, mut predicate: impl FnMut(&V) -> bool) -> usize {
        let doomed: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, slot)| predicate(&slot.value))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
