/// A collection that issues stable ids and recycles the ids of removed
/// elements. Lookup is a vector index; iteration skips holes.
pub struct SparseCollection<T: SparseElement> {
    vector: Vec<Option<T>>,
    index_free_list: Vec<usize>,
}

pub trait SparseElement {
    type Id: Copy + Eq + std::hash::Hash + Into<usize> + From<usize>;

    fn id(&self) -> Self::Id;
    fn set_id(&mut self, id: Self::Id);
}

impl<T: SparseElement> SparseCollection<T> {
    pub fn new() -> Self {
        Self {
            vector: Vec::new(),
            index_free_list: Vec::new(),
        }
    }

    pub fn add(&mut self, mut element: T) -> T::Id {
        let index = if let Some(index) = self.index_free_list.pop() {
            index
        } else {
            self.vector.push(None);
            self.vector.len() - 1
        };
        element.set_id(index.into());
        self.vector[index] = Some(element);
        index.into()
    }

    pub fn remove(&mut self, id: T::Id) -> Option<T> {
        let element = self.vector[id.into()].take();
        if element.is_some() {
            self.index_free_list.push(id.into());
        }
        element
    }

    pub fn size(&self) -> usize {
        self.vector.len()
    }

    pub fn at(&self, id: T::Id) -> Option<&T> {
        self.vector.get(id.into()).and_then(|x| x.as_ref())
    }

    pub fn at_mut(&mut self, id: T::Id) -> Option<&mut T> {
        self.vector.get_mut(id.into()).and_then(|x| x.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.vector.iter().filter_map(|x| x.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.vector.iter_mut().filter_map(|x| x.as_mut())
    }
}

impl<T: SparseElement> Default for SparseCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}
